//! Service configuration, read from the environment (and a `.env` file, if present).

use crate::gate::{Limits, DEFAULT_MAX_FILE_BYTES, MAX_PAGES_PER_CONVERSION};
use crate::markup::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TIMEOUT};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
pub const DEFAULT_KEY_PREFIX: &str = "pdf2latex:";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
const DEVELOPMENT_SECRET_KEY: &str = "dev-secret-key-change-in-production";

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub openai_timeout: Duration,
    pub limits: Limits,
    pub redis_url: String,
    pub key_prefix: String,
    pub fail_open: bool,
    pub pdfium_library_path: Option<PathBuf>,
    pub secret_key: String,
    pub development: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let openai_api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let timeout_secs = parse(&get, "OPENAI_TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs())?;
        let max_file_bytes = parse(&get, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_BYTES)?;
        let fail_open = match get("QUOTA_FAIL_OPEN") {
            None => true,
            Some(value) => parse_bool(&value).ok_or_else(|| ConfigError::Invalid {
                name: "QUOTA_FAIL_OPEN",
                value,
                reason: "expected true or false".to_string(),
            })?,
        };

        Ok(Config {
            openai_api_key,
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            openai_timeout: Duration::from_secs(timeout_secs),
            limits: Limits {
                max_file_bytes,
                max_pages: MAX_PAGES_PER_CONVERSION,
            },
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            key_prefix: lookup("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            fail_open,
            pdfium_library_path: get("PDFIUM_LIB_PATH").map(PathBuf::from),
            secret_key: get("FLASK_SECRET_KEY")
                .unwrap_or_else(|| DEVELOPMENT_SECRET_KEY.to_string()),
            development: get("FLASK_ENV").as_deref() == Some("development"),
            host: get("FLASK_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse(&get, "FLASK_PORT", DEFAULT_PORT)?,
        })
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        if self.development {
            "debug"
        } else {
            "info"
        }
    }

    /// Logs a warning for settings that are only acceptable during development.
    pub fn warn_insecure_defaults(&self) {
        if !self.development && self.secret_key == DEVELOPMENT_SECRET_KEY {
            log::warn!(
                "FLASK_SECRET_KEY is set to the development default, set a unique value in production"
            );
        }
    }

    /// Key namespace for the shared store; an empty prefix disables namespacing.
    pub fn key_prefix(&self) -> Option<&str> {
        Some(self.key_prefix.as_str()).filter(|p| !p.is_empty())
    }
}

fn parse<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
