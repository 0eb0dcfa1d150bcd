use crate::quota::{Denial, QuotaStatus};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use once_cell::sync::Lazy;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Sets the following headers from the quota status:
///
/// - `x-ratelimit-limit`\
/// - `x-ratelimit-remaining`\
/// - `x-ratelimit-reset` (seconds until the reset)
pub fn insert_status(map: &mut HeaderMap, status: &QuotaStatus) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.reset_after),
    );
}

/// As [insert_status], plus `retry-after` (seconds until the violated rule resets).
pub fn insert_denied(map: &mut HeaderMap, denial: &Denial) {
    insert_status(map, &denial.status);
    map.insert(RETRY_AFTER, HeaderValue::from(denial.retry_after));
}
