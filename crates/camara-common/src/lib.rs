//! Camara Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling and logging for the camara workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CamaraError`] for input and domain validation
//! - **Types**: the ingested [`Entity`] kinds, [`IngestMode`] and inclusive [`DateRange`]s
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```
//! use camara_common::{DateRange, Entity};
//! use chrono::NaiveDate;
//!
//! let entity: Entity = "votacoes".parse().unwrap();
//! assert_eq!(entity, Entity::VotingSessions);
//!
//! let range = DateRange::new(
//!     NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
//!     NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
//! )
//! .unwrap();
//! assert_eq!(range.num_days(), 6);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CamaraError, Result};
pub use types::{DateRange, Entity, EntitySelector, IngestMode};
