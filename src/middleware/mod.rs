pub mod headers;

use crate::error::AppError;
use crate::identity::ClientIdentity;
use crate::quota::{Decision, QuotaPolicy, Tier};
use crate::store::QuotaStore;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::ResponseError;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Rate limit middleware, charging one [Tier] for every request it wraps.
///
/// Allowed responses carry the `x-ratelimit-*` headers; denied requests never reach the wrapped
/// service and are answered with a 429.
pub struct RateLimiter<S> {
    policy: Arc<QuotaPolicy<S>>,
    tier: Tier,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            tier: self.tier,
        }
    }
}

impl<S: QuotaStore + 'static> RateLimiter<S> {
    pub fn new(policy: Arc<QuotaPolicy<S>>, tier: Tier) -> Self {
        Self { policy, tier }
    }
}

impl<T, B, S> Transform<T, ServiceRequest> for RateLimiter<S>
where
    T: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    T::Future: 'static,
    B: 'static,
    S: QuotaStore + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<T, S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: T) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            policy: self.policy.clone(),
            tier: self.tier,
        })
    }
}

pub struct RateLimiterMiddleware<T, S> {
    service: Rc<RefCell<T>>,
    policy: Arc<QuotaPolicy<S>>,
    tier: Tier,
}

impl<T, B, S> Service<ServiceRequest> for RateLimiterMiddleware<T, S>
where
    T: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    T::Future: 'static,
    B: 'static,
    S: QuotaStore + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let policy = self.policy.clone();
        let tier = self.tier;

        Box::pin(async move {
            let identity = ClientIdentity::from_request(req.request());

            let status = match policy.check_and_consume(identity.as_str(), tier).await {
                Ok(Decision::Allowed(status)) => status,
                Ok(Decision::Denied(denial)) => {
                    let response = AppError::QuotaExceeded(denial).error_response();
                    return Ok(req.into_response(response).map_into_right_body());
                }
                // Only returned when the policy fails closed
                Err(e) => {
                    let response = AppError::QuotaUnavailable(e.to_string()).error_response();
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let mut service_response = service.call(req).await?;
            if let Some(status) = status {
                headers::insert_status(service_response.headers_mut(), &status);
            }
            Ok(service_response.map_into_left_body())
        })
    }
}
