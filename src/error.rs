//! Custom error types for rustbiblio.
//!
//! Only configuration problems and failed final writes surface as `Err` to the
//! pipeline caller. Everything recoverable is reported through [`crate::outcome::Issue`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for rustbiblio operations.
#[derive(Debug, Error)]
pub enum BiblioError {
    /// Network/HTTP request error other than a timeout
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// Request did not complete within its deadline
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Response body or HTML could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// Rate limited by external API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// External API returned an error status
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// Scraping target served a CAPTCHA or block page
    #[error("Blocked by source: {0}")]
    Blocked(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// An output file could not be written, even with the fallback encoding
    #[error("Failed to persist {}: {message}", path.display())]
    Persist {
        /// Target file
        path: PathBuf,
        /// Last write failure
        message: String,
    },
}

impl From<reqwest::Error> for BiblioError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            let target = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "request".to_string());
            BiblioError::Timeout(target)
        } else {
            BiblioError::Network(e)
        }
    }
}

impl BiblioError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Timeouts, connection failures, 429, 5xx and malformed bodies are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            BiblioError::Network(e) => {
                e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            BiblioError::Timeout(_) | BiblioError::RateLimited(_) | BiblioError::Parse(_) => true,
            BiblioError::Json(_) => true,
            BiblioError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Result type alias using `BiblioError`
pub type Result<T> = std::result::Result<T, BiblioError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| BiblioError::Parse(msg.to_string()))
    }
}
