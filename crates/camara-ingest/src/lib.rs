//! Camara Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingestion engine for the Chamber of Deputies open data API.
//!
//! # Overview
//!
//! - **API Client**: paginated requests with rate limiting and bounded retries ([`api`])
//! - **Transformer**: raw JSON records to flat rows ([`transform`])
//! - **Loader**: idempotent per-batch upserts into PostgreSQL ([`loader`])
//! - **Watermarks**: last committed date per entity ([`watermark`])
//! - **Orchestrator**: full and incremental runs, chunked by date ([`orchestrator`])
//! - **Scheduler**: cron cadences and per-entity run exclusion ([`scheduler`])
//!
//! # Example
//!
//! ```no_run
//! use camara_common::{EntitySelector, IngestMode};
//! use camara_ingest::{
//!     api::ApiClient, config::IngestConfig, loader::PgLoader,
//!     orchestrator::{ExtractionOrchestrator, OrchestratorSettings, RunRequest},
//!     watermark::PgWatermarkStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pool = sqlx::PgPool::connect("postgresql://localhost/camara").await?;
//!
//!     let orchestrator = ExtractionOrchestrator::new(
//!         Arc::new(ApiClient::new(&config)?),
//!         Arc::new(PgLoader::new(pool.clone())),
//!         Arc::new(PgWatermarkStore::new(pool)),
//!         OrchestratorSettings::from(&config),
//!     );
//!
//!     let request = RunRequest::new(IngestMode::Incremental, EntitySelector::All).last_days(7);
//!     let report = orchestrator.run(&request).await?;
//!     for outcome in &report.outcomes {
//!         println!("{outcome}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod scheduler;
pub mod transform;
pub mod watermark;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use orchestrator::{ExtractionOrchestrator, OrchestratorSettings, RunRequest};
pub use report::{EntityOutcome, EntityStatus, RunReport};
pub use scheduler::Scheduler;
