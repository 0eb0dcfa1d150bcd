use crate::gate::ValidationError;
use crate::markup::GenerationError;
use crate::middleware::headers;
use crate::pdf::RasterError;
use crate::quota::Denial;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Every failure a request can end with. The display text is what the client sees.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Rate limit exceeded")]
    QuotaExceeded(Denial),
    #[error("Rate limiting is temporarily unavailable, please try again later ({0})")]
    QuotaUnavailable(String),
    #[error("Conversion failed: {0}")]
    Raster(RasterError),
    #[error("Conversion failed: {0}")]
    Generation(GenerationError),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::QuotaUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Raster(_) | AppError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::QuotaExceeded(denial) => {
                let mut response = HttpResponse::TooManyRequests().json(json!({
                    "error": self.to_string(),
                    "message": denial.message(),
                    "limit_type": denial.tier.name(),
                    "retry_after": denial.retry_after,
                }));
                headers::insert_denied(response.headers_mut(), denial);
                response
            }
            _ => {
                if self.status_code().is_server_error() {
                    log::error!("{self}");
                }
                HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
            }
        }
    }
}
