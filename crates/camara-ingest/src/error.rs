//! Engine error taxonomy

use camara_common::CamaraError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Timeout, connection reset, HTTP 5xx or 429
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    /// Any other HTTP 4xx; never retried
    #[error("Upstream rejected request with HTTP {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// 2xx response whose body is not the expected envelope
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    /// Undefined table or column, type mismatch: the whole batch is unusable
    #[error("Structural storage failure: {0}")]
    Structural(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Domain(#[from] CamaraError),

    #[error("Run cancelled before completion")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            IngestError::Decode(err.to_string())
        } else if let Some(status) = err.status().filter(|s| s.is_client_error()) {
            if status.as_u16() == 429 {
                IngestError::Transient(err.to_string())
            } else {
                IngestError::Client {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            }
        } else {
            IngestError::Transient(err.to_string())
        }
    }
}
