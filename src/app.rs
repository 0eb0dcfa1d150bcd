use crate::error::AppError;
use crate::gate::{Limits, RequestGate, Upload, ValidationError};
use crate::identity::ClientIdentity;
use crate::middleware::{headers, RateLimiter};
use crate::quota::{QuotaStatus, Tier, Window};
use crate::store::Store;
use actix_multipart::Multipart;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::BytesMut;
use futures::StreamExt;
use serde_json::json;

const UPLOAD_FIELD: &str = "pdf_file";
const SERVICE_NAME: &str = "pdf-latex-converter";

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const MAX_FILE_MB_PLACEHOLDER: &str = "{{MAX_FILE_MB}}";
const MAX_PAGES_PLACEHOLDER: &str = "{{MAX_PAGES}}";
const CONVERSIONS_PER_DAY_PLACEHOLDER: &str = "{{CONVERSIONS_PER_DAY}}";

/// Shared by every worker.
pub struct AppState {
    pub gate: RequestGate<Store>,
}

/// Registers the routes. `/` and `/health` are limited as a whole; `/convert` and `/validate`
/// charge their tier from within the gate, after the cheap upload checks.
pub fn configure(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        let policy = state.gate.policy().clone();
        cfg.app_data(state)
            .service(
                web::resource("/")
                    .route(web::get().to(index))
                    .wrap(RateLimiter::new(policy.clone(), Tier::General)),
            )
            .service(
                web::resource("/health")
                    .route(web::get().to(health))
                    .wrap(RateLimiter::new(policy, Tier::Health)),
            )
            .service(web::resource("/convert").route(web::post().to(convert)))
            .service(web::resource("/validate").route(web::post().to(validate)));
    }
}

async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_index(state.gate.limits()))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

async fn convert(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = ClientIdentity::from_request(&req);
    let upload = read_upload(&req, payload, state.gate.limits().max_file_bytes).await?;
    let conversion = state.gate.convert(&identity, upload).await?;
    Ok(with_status(
        HttpResponse::Ok().json(json!({ "success": true, "latex_code": conversion.latex })),
        conversion.quota,
    ))
}

async fn validate(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = ClientIdentity::from_request(&req);
    let upload = read_upload(&req, payload, state.gate.limits().max_file_bytes).await?;
    let validated = state.gate.validate(&identity, upload).await?;
    Ok(with_status(
        HttpResponse::Ok().json(json!({
            "valid": true,
            "page_count": validated.info.page_count,
            "max_pages": state.gate.limits().max_pages,
            "title": validated.info.title,
            "author": validated.info.author,
        })),
        validated.quota,
    ))
}

fn with_status(mut response: HttpResponse, status: Option<QuotaStatus>) -> HttpResponse {
    if let Some(status) = status {
        headers::insert_status(response.headers_mut(), &status);
    }
    response
}

/// Reads the `pdf_file` part of a multipart request.
///
/// At most `max_bytes + 1` bytes of the file are kept; reading stops as soon as the file is
/// known to be too large. Requests that are not multipart have no upload.
async fn read_upload(
    req: &HttpRequest,
    mut payload: Multipart,
    max_bytes: u64,
) -> Result<Option<Upload>, ValidationError> {
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));
    if !is_multipart {
        return Ok(None);
    }

    let cap = usize::try_from(max_bytes.saturating_add(1)).unwrap_or(usize::MAX);
    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let disposition = field.content_disposition();
        if disposition.get_name() != Some(UPLOAD_FIELD) {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| ValidationError::Malformed(e.to_string()))?;
            }
            continue;
        }
        let filename = disposition.get_filename().unwrap_or_default().to_string();

        let mut buf = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ValidationError::Malformed(e.to_string()))?;
            let take = chunk.len().min(cap - buf.len());
            buf.extend_from_slice(&chunk[..take]);
            if buf.len() == cap {
                break;
            }
        }
        return Ok(Some(Upload {
            filename,
            bytes: buf.freeze(),
        }));
    }
    Ok(None)
}

pub fn render_index(limits: &Limits) -> String {
    let per_day = Tier::Convert
        .rules()
        .iter()
        .find(|rule| rule.window == Window::Day)
        .map(|rule| rule.max_count)
        .unwrap_or_default();
    INDEX_TEMPLATE
        .replace(MAX_FILE_MB_PLACEHOLDER, &format!("{:.1}", limits.max_file_mb()))
        .replace(MAX_PAGES_PLACEHOLDER, &limits.max_pages.to_string())
        .replace(CONVERSIONS_PER_DAY_PLACEHOLDER, &per_day.to_string())
}
