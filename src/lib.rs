#![cfg_attr(docsrs, feature(doc_cfg))]
//! An HTTP service that turns uploaded PDFs into LaTeX documents through a vision model, with
//! per-client quotas kept in Redis or in memory.

pub mod app;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod markup;
pub mod middleware;
pub mod pdf;
pub mod quota;
pub mod store;

pub use app::{configure, AppState};
pub use config::Config;
pub use error::AppError;
pub use middleware::RateLimiter;
