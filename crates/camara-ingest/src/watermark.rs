//! Per-entity watermarks
//!
//! A watermark is the last date whose data is durably committed. It only
//! moves forward through [`WatermarkStore::advance`]; full runs move it back
//! explicitly with [`WatermarkStore::reset`].

use async_trait::async_trait;
use camara_common::Entity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::{collections::BTreeMap, sync::Mutex};
use tracing::{info, warn};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatermarkKey {
    pub entity: Entity,
    /// Optional sub-partition, e.g. a deputy id
    pub partition: Option<String>,
}

impl WatermarkKey {
    pub fn entity(entity: Entity) -> Self {
        Self {
            entity,
            partition: None,
        }
    }

    pub fn partitioned(entity: Entity, partition: impl Into<String>) -> Self {
        Self {
            entity,
            partition: Some(partition.into()),
        }
    }

    fn partition_column(&self) -> &str {
        self.partition.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.partition {
            Some(p) => write!(f, "{}/{}", self.entity, p),
            None => write!(f, "{}", self.entity),
        }
    }
}

/// Result of an [`WatermarkStore::advance`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Cursor stored (including the no-op of advancing to the same date)
    Advanced,
    /// Cursor would have moved backwards; the stored value is kept
    Rejected { current: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub key: WatermarkKey,
    pub cursor: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// `None` when the entity never completed a chunk
    async fn get(&self, key: &WatermarkKey) -> Result<Option<NaiveDate>>;

    /// Move the cursor forward; regressions are rejected and reported
    async fn advance(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<Advance>;

    /// Unconditionally set the cursor (full refresh)
    async fn reset(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<()>;

    async fn list(&self) -> Result<Vec<Watermark>>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    cursors: Mutex<BTreeMap<WatermarkKey, (NaiveDate, DateTime<Utc>)>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<WatermarkKey, (NaiveDate, DateTime<Utc>)>>>
    {
        self.cursors
            .lock()
            .map_err(|_| IngestError::Structural("watermark store lock poisoned".to_string()))
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<NaiveDate>> {
        Ok(self.lock()?.get(key).map(|(cursor, _)| *cursor))
    }

    async fn advance(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<Advance> {
        let mut cursors = self.lock()?;
        if let Some((current, _)) = cursors.get(key) {
            if *current > cursor {
                warn!(key = %key, %current, requested = %cursor, "Rejected watermark regression");
                return Ok(Advance::Rejected { current: *current });
            }
        }
        cursors.insert(key.clone(), (cursor, Utc::now()));
        Ok(Advance::Advanced)
    }

    async fn reset(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<()> {
        self.lock()?.insert(key.clone(), (cursor, Utc::now()));
        info!(key = %key, %cursor, "Watermark reset");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, (cursor, updated_at))| Watermark {
                key: key.clone(),
                cursor: *cursor,
                updated_at: *updated_at,
            })
            .collect())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<NaiveDate>> {
        let cursor = sqlx::query_scalar::<_, NaiveDate>(
            "SELECT cursor_date FROM ingest_watermarks WHERE entity = $1 AND partition = $2",
        )
        .bind(key.entity.as_str())
        .bind(key.partition_column())
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor)
    }

    async fn advance(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<Advance> {
        // The WHERE clause makes the monotonic check and the write one statement
        let stored = sqlx::query_scalar::<_, NaiveDate>(
            r#"
            INSERT INTO ingest_watermarks (entity, partition, cursor_date, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (entity, partition) DO UPDATE
                SET cursor_date = EXCLUDED.cursor_date, updated_at = now()
                WHERE ingest_watermarks.cursor_date <= EXCLUDED.cursor_date
            RETURNING cursor_date
            "#,
        )
        .bind(key.entity.as_str())
        .bind(key.partition_column())
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await?;

        if stored.is_some() {
            return Ok(Advance::Advanced);
        }

        let current = self.get(key).await?.unwrap_or(cursor);
        warn!(key = %key, %current, requested = %cursor, "Rejected watermark regression");
        Ok(Advance::Rejected { current })
    }

    async fn reset(&self, key: &WatermarkKey, cursor: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_watermarks (entity, partition, cursor_date, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (entity, partition) DO UPDATE
                SET cursor_date = EXCLUDED.cursor_date, updated_at = now()
            "#,
        )
        .bind(key.entity.as_str())
        .bind(key.partition_column())
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        info!(key = %key, %cursor, "Watermark reset");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>> {
        let rows = sqlx::query_as::<_, (String, String, NaiveDate, DateTime<Utc>)>(
            r#"
            SELECT entity, partition, cursor_date, updated_at
            FROM ingest_watermarks
            ORDER BY entity, partition
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(entity, partition, cursor, updated_at)| -> Result<Watermark> {
                Ok(Watermark {
                    key: WatermarkKey {
                        entity: entity.parse()?,
                        partition: (!partition.is_empty()).then_some(partition),
                    },
                    cursor,
                    updated_at,
                })
            })
            .collect()
    }
}
