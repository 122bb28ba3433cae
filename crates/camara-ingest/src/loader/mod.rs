//! Idempotent batch loading
//!
//! A [`Loader`] writes one [`Batch`] per transaction, parents first. A row
//! that violates a constraint is skipped and reported; anything that makes
//! the whole batch unusable is returned as an error and nothing is kept.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;

pub use memory::InMemoryStore;
pub use postgres::PgLoader;

use crate::{
    error::Result,
    models::{Batch, RecordKey},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub key: RecordKey,
    pub reason: String,
}

/// Outcome of one committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub upserted: usize,
    pub skipped: Vec<SkippedRow>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.upserted += other.upserted;
        self.skipped.extend(other.skipped);
    }
}

#[async_trait]
pub trait Loader: Send + Sync {
    /// Upsert every record of `batch` in a single transaction. Returns only
    /// after the transaction committed.
    async fn upsert_batch(&self, batch: &Batch) -> Result<LoadReport>;

    /// Ids of every stored deputy, ascending
    async fn deputy_ids(&self) -> Result<Vec<i64>>;
}
