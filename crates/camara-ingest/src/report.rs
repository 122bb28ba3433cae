//! Run statistics and per-entity outcomes

use camara_common::{DateRange, Entity, IngestMode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::loader::SkippedRow;

/// Counters for one entity within one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityStats {
    /// Page requests that returned successfully
    pub pages: usize,
    pub records_fetched: usize,
    pub upserted: usize,
    pub skipped: usize,
    /// Transformer data-quality warnings
    pub warnings: usize,
    /// Chunks whose batches committed and whose watermark advanced
    pub chunks_committed: usize,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EntityStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark as completed and calculate duration
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_secs = (now - started).num_milliseconds() as f64 / 1000.0;
        }
    }

    pub fn records_per_second(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.upserted as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            pages: self.pages + other.pages,
            records_fetched: self.records_fetched + other.records_fetched,
            upserted: self.upserted + other.upserted,
            skipped: self.skipped + other.skipped,
            warnings: self.warnings + other.warnings,
            chunks_committed: self.chunks_committed + other.chunks_committed,
            duration_secs: self.duration_secs + other.duration_secs,
            started_at: self.started_at.or(other.started_at),
            completed_at: other.completed_at.or(self.completed_at),
        }
    }
}

/// Aggregate status of one entity at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Succeeded,
    PartiallySucceeded {
        skipped: usize,
    },
    Failed {
        reason: String,
        /// Chunk being processed when the failure happened
        range: Option<DateRange>,
    },
    /// Not started because a run of the same entity was in progress
    Refused,
}

impl EntityStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, EntityStatus::Failed { .. })
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityStatus::Succeeded => write!(f, "succeeded"),
            EntityStatus::PartiallySucceeded { skipped } => {
                write!(f, "partially succeeded ({skipped} skipped rows)")
            },
            EntityStatus::Failed {
                reason,
                range: Some(range),
            } => write!(f, "failed at {range}: {reason}"),
            EntityStatus::Failed { reason, range: None } => write!(f, "failed: {reason}"),
            EntityStatus::Refused => write!(f, "refused (already running)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityOutcome {
    pub entity: Entity,
    pub mode: IngestMode,
    /// Planned range; `None` when there was nothing to fetch
    pub range: Option<DateRange>,
    pub status: EntityStatus,
    pub stats: EntityStats,
    pub skipped_rows: Vec<SkippedRow>,
}

impl EntityOutcome {
    pub fn refused(entity: Entity, mode: IngestMode) -> Self {
        Self {
            entity,
            mode,
            range: None,
            status: EntityStatus::Refused,
            stats: EntityStats::default(),
            skipped_rows: Vec::new(),
        }
    }
}

impl std::fmt::Display for EntityOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<16} {:<12} ", self.entity, self.mode)?;
        match self.range {
            Some(range) => write!(f, "{range:<26} ")?,
            None => write!(f, "{:<26} ", "-")?,
        }
        write!(
            f,
            "{} | pages={} fetched={} upserted={} skipped={} warnings={} in {:.1}s",
            self.status,
            self.stats.pages,
            self.stats.records_fetched,
            self.stats.upserted,
            self.stats.skipped,
            self.stats.warnings,
            self.stats.duration_secs
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: IngestMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// One entry per requested entity, in dependency order
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.status.is_failure())
    }

    pub fn outcome(&self, entity: Entity) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.entity == entity)
    }

    /// Totals across entities
    pub fn totals(&self) -> EntityStats {
        self.outcomes
            .iter()
            .map(|o| o.stats.clone())
            .fold(EntityStats::default(), EntityStats::merge)
    }
}
