//! Per-entity run state machine and its persistence
//!
//! `Idle → Running → (Succeeded | Failed) → Idle`

use async_trait::async_trait;
use camara_common::{Entity, IngestMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::{collections::BTreeMap, sync::Mutex};
use uuid::Uuid;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::Running)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Succeeded, RunState::Idle)
                | (RunState::Failed, RunState::Idle)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(RunState::Idle),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            other => Err(IngestError::Structural(format!("unknown run state '{other}'"))),
        }
    }
}

/// Persisted state of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRunState {
    pub entity: Entity,
    pub state: RunState,
    pub mode: Option<IngestMode>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Display form of the last terminal outcome
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRunState {
    pub fn idle(entity: Entity, now: DateTime<Utc>) -> Self {
        Self {
            entity,
            state: RunState::Idle,
            mode: None,
            run_id: None,
            started_at: None,
            finished_at: None,
            last_outcome: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: RunState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::Structural(format!(
                "invalid run state transition for {}: {} -> {}",
                self.entity, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, entity: Entity) -> Result<Option<EntityRunState>>;

    async fn save(&self, state: &EntityRunState) -> Result<()>;

    async fn list(&self) -> Result<Vec<EntityRunState>>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Keeps the current state plus every saved state in order
#[derive(Debug, Default)]
pub struct MemoryRunStateStore {
    states: Mutex<BTreeMap<Entity, EntityRunState>>,
    history: Mutex<Vec<(Entity, RunState)>>,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// States saved for `entity`, oldest first
    pub fn history(&self, entity: Entity) -> Vec<RunState> {
        self.history
            .lock()
            .map(|h| {
                h.iter()
                    .filter(|(e, _)| *e == entity)
                    .map(|(_, state)| *state)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn poisoned() -> IngestError {
    IngestError::Structural("run state store lock poisoned".to_string())
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn load(&self, entity: Entity) -> Result<Option<EntityRunState>> {
        Ok(self.states.lock().map_err(|_| poisoned())?.get(&entity).cloned())
    }

    async fn save(&self, state: &EntityRunState) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| poisoned())?
            .insert(state.entity, state.clone());
        self.history
            .lock()
            .map_err(|_| poisoned())?
            .push((state.entity, state.state));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<EntityRunState>> {
        Ok(self
            .states
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgRunStateStore {
    pool: PgPool,
}

impl PgRunStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type RunStateRow = (
    String,
    String,
    Option<String>,
    Option<Uuid>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const SELECT_RUN_STATE: &str = r#"
    SELECT entity, state, mode, run_id, started_at, finished_at,
           last_outcome, last_error, updated_at
    FROM ingest_run_state
"#;

fn from_row(row: RunStateRow) -> Result<EntityRunState> {
    let (entity, state, mode, run_id, started_at, finished_at, last_outcome, last_error, updated_at) =
        row;
    Ok(EntityRunState {
        entity: entity.parse()?,
        state: state.parse()?,
        mode: mode.map(|m| m.parse::<IngestMode>()).transpose()?,
        run_id,
        started_at,
        finished_at,
        last_outcome,
        last_error,
        updated_at,
    })
}

#[async_trait]
impl RunStateStore for PgRunStateStore {
    async fn load(&self, entity: Entity) -> Result<Option<EntityRunState>> {
        let row = sqlx::query_as::<_, RunStateRow>(&format!("{SELECT_RUN_STATE} WHERE entity = $1"))
            .bind(entity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(from_row).transpose()
    }

    async fn save(&self, state: &EntityRunState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_run_state (
                entity, state, mode, run_id, started_at, finished_at,
                last_outcome, last_error, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (entity) DO UPDATE SET
                state = EXCLUDED.state,
                mode = EXCLUDED.mode,
                run_id = EXCLUDED.run_id,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                last_outcome = EXCLUDED.last_outcome,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.entity.as_str())
        .bind(state.state.as_str())
        .bind(state.mode.map(|m| m.to_string()))
        .bind(state.run_id)
        .bind(state.started_at)
        .bind(state.finished_at)
        .bind(&state.last_outcome)
        .bind(&state.last_error)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<EntityRunState>> {
        let rows = sqlx::query_as::<_, RunStateRow>(&format!("{SELECT_RUN_STATE} ORDER BY entity"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(from_row).collect()
    }
}
