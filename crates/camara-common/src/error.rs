//! Error types shared across the camara crates

use chrono::NaiveDate;
use thiserror::Error;

/// Result type alias for camara domain operations
pub type Result<T> = std::result::Result<T, CamaraError>;

/// Domain and input validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CamaraError {
    #[error("Unknown entity '{0}'. Expected one of: deputies, expenses, speeches, voting_sessions, votes, all")]
    UnknownEntity(String),

    #[error("Unknown ingest mode '{0}'. Expected 'full' or 'incremental'")]
    UnknownMode(String),

    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Invalid run request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
