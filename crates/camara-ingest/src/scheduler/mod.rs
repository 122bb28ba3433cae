//! Run scheduler
//!
//! Owns the per-entity state machine. Every run, whether triggered by a cron
//! cadence or by the CLI, goes through [`Scheduler::trigger`], which refuses
//! entities that already have a run in flight and persists each transition
//! through a [`RunStateStore`].
//!
//! Runs in this process are tracked in memory. Runs owned by another process
//! (the daemon versus a one-shot CLI run) are seen through the persisted
//! `Running` state, which counts as live until its lease expires: the run
//! timeout, or [`DEFAULT_RUN_LEASE`] when runs have no timeout.

pub mod state;

use camara_common::{Entity, EntitySelector, IngestMode};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::{
    collections::HashSet,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use state::{EntityRunState, MemoryRunStateStore, PgRunStateStore, RunState, RunStateStore};

use crate::{
    config::IngestConfig,
    error::{IngestError, Result},
    orchestrator::{ExtractionOrchestrator, RunRequest},
    report::{EntityOutcome, EntityStatus, RunReport},
};

/// How often the daemon evaluates cadences
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Recorded as the failure of a run the process did not live to finish
const INTERRUPTED: &str = "interrupted";

/// Lease of a persisted `Running` state when runs have no timeout
pub const DEFAULT_RUN_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// A cron expression bound to a run request
#[derive(Debug, Clone)]
pub struct Cadence {
    pub name: String,
    pub expression: String,
    pub mode: IngestMode,
    pub entities: EntitySelector,
    schedule: Schedule,
}

impl Cadence {
    pub fn new(
        name: impl Into<String>,
        expression: &str,
        mode: IngestMode,
        entities: EntitySelector,
    ) -> Result<Self> {
        let name = name.into();
        let schedule = Schedule::from_str(expression).map_err(|e| {
            IngestError::Config(format!("invalid cron expression '{expression}' for {name}: {e}"))
        })?;
        Ok(Self {
            name,
            expression: expression.to_string(),
            mode,
            entities,
            schedule,
        })
    }

    /// Daily incremental and weekly full runs of every entity
    pub fn from_config(config: &IngestConfig) -> Result<Vec<Cadence>> {
        Ok(vec![
            Cadence::new(
                "incremental",
                &config.incremental_schedule,
                IngestMode::Incremental,
                EntitySelector::All,
            )?,
            Cadence::new(
                "full",
                &config.full_schedule,
                IngestMode::Full,
                EntitySelector::All,
            )?,
        ])
    }

    /// Whether an occurrence falls in `(since, now]`
    pub fn is_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.schedule
            .after(&since)
            .next()
            .is_some_and(|next| next <= now)
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn request(&self) -> RunRequest {
        RunRequest::new(self.mode, self.entities)
    }
}

/// Cadences with the instant each was last fired.
///
/// Every cadence starts as if fired at creation time, so occurrences before
/// the daemon started are never replayed.
#[derive(Debug, Clone)]
pub struct Timetable {
    entries: Vec<(Cadence, DateTime<Utc>)>,
}

impl Timetable {
    pub fn new(cadences: Vec<Cadence>, started: DateTime<Utc>) -> Self {
        Self {
            entries: cadences.into_iter().map(|c| (c, started)).collect(),
        }
    }

    /// Cadences due at `now`, marking them fired
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Cadence> {
        let mut due = Vec::new();
        for (cadence, last) in &mut self.entries {
            if cadence.is_due(*last, now) {
                *last = now;
                due.push(cadence.clone());
            }
        }
        due
    }
}

/// Entities claimed by a run, released on drop
struct Claim {
    running: Arc<Mutex<HashSet<Entity>>>,
    entities: Vec<Entity>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            for entity in &self.entities {
                running.remove(entity);
            }
        }
    }
}

pub struct Scheduler {
    orchestrator: Arc<ExtractionOrchestrator>,
    states: Arc<dyn RunStateStore>,
    running: Arc<Mutex<HashSet<Entity>>>,
    cadences: Vec<Cadence>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<ExtractionOrchestrator>, states: Arc<dyn RunStateStore>) -> Self {
        Self {
            orchestrator,
            states,
            running: Arc::new(Mutex::new(HashSet::new())),
            cadences: Vec::new(),
        }
    }

    pub fn with_cadences(mut self, cadences: Vec<Cadence>) -> Self {
        self.cadences = cadences;
        self
    }

    pub fn cadences(&self) -> &[Cadence] {
        &self.cadences
    }

    /// Entities with a run in flight, in dependency order
    pub fn running(&self) -> Vec<Entity> {
        let mut running: Vec<Entity> = self
            .running
            .lock()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        running.sort();
        running
    }

    fn now(&self) -> DateTime<Utc> {
        self.orchestrator.clock().now()
    }

    /// Claim every free entity; the rest are returned as refused
    fn claim(&self, entities: &[Entity]) -> Result<(Claim, Vec<Entity>)> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| IngestError::Structural("scheduler lock poisoned".to_string()))?;

        let mut claimed = Vec::new();
        let mut refused = Vec::new();
        for &entity in entities {
            if running.insert(entity) {
                claimed.push(entity);
            } else {
                refused.push(entity);
            }
        }

        let claim = Claim {
            running: Arc::clone(&self.running),
            entities: claimed,
        };
        Ok((claim, refused))
    }

    /// Settle states left behind by a process that died mid-run.
    ///
    /// `Running` entities are recorded as `Failed` ("interrupted"); every
    /// entity ends up `Idle`. Returns the interrupted entities.
    pub async fn recover(&self) -> Result<Vec<Entity>> {
        let mut interrupted = Vec::new();
        for mut state in self.states.list().await? {
            if state.state == RunState::Running {
                warn!(entity = %state.entity, run_id = ?state.run_id, "Recovering interrupted run");
                interrupted.push(state.entity);
            }
            self.settle(&mut state).await?;
        }
        Ok(interrupted)
    }

    /// Bring a persisted state back to `Idle`
    async fn settle(&self, state: &mut EntityRunState) -> Result<()> {
        if state.state == RunState::Running {
            state.transition(RunState::Failed, self.now())?;
            state.finished_at = Some(self.now());
            state.last_outcome = Some(format!("failed: {INTERRUPTED}"));
            state.last_error = Some(INTERRUPTED.to_string());
            self.states.save(state).await?;
        }
        if state.state != RunState::Idle {
            state.transition(RunState::Idle, self.now())?;
            self.states.save(state).await?;
        }
        Ok(())
    }

    /// Whether a persisted `Running` state still belongs to a live run
    fn lease_held(&self, state: &EntityRunState) -> bool {
        if state.state != RunState::Running {
            return false;
        }
        let Some(started_at) = state.started_at else {
            return false;
        };
        let lease = self
            .orchestrator
            .settings()
            .run_timeout
            .unwrap_or(DEFAULT_RUN_LEASE);
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        self.now().signed_duration_since(started_at) < lease
    }

    /// Move `entity` to `Running`, or `None` when another process holds it
    async fn begin(
        &self,
        entity: Entity,
        mode: IngestMode,
        run_id: Uuid,
    ) -> Result<Option<EntityRunState>> {
        let mut state = match self.states.load(entity).await? {
            Some(state) => state,
            None => EntityRunState::idle(entity, self.now()),
        };
        if self.lease_held(&state) {
            warn!(
                %entity,
                run_id = ?state.run_id,
                started_at = ?state.started_at,
                "Entity running in another process, refusing trigger"
            );
            return Ok(None);
        }
        // not claimed anywhere and past its lease
        self.settle(&mut state).await?;

        state.transition(RunState::Running, self.now())?;
        state.mode = Some(mode);
        state.run_id = Some(run_id);
        state.started_at = Some(self.now());
        state.finished_at = None;
        self.states.save(&state).await?;
        Ok(Some(state))
    }

    async fn finish(&self, mut state: EntityRunState, status: &EntityStatus) -> Result<()> {
        let (next, error) = match status {
            EntityStatus::Failed { reason, .. } => (RunState::Failed, Some(reason.clone())),
            _ => (RunState::Succeeded, None),
        };
        state.transition(next, self.now())?;
        state.finished_at = Some(self.now());
        state.last_outcome = Some(status.to_string());
        state.last_error = error;
        self.states.save(&state).await?;

        state.transition(RunState::Idle, self.now())?;
        self.states.save(&state).await
    }

    pub async fn trigger(&self, request: &RunRequest) -> Result<RunReport> {
        self.trigger_with(request, CancellationToken::new()).await
    }

    /// Run `request` for every entity not already running; the others are
    /// reported as refused.
    #[instrument(skip_all, fields(mode = %request.mode))]
    pub async fn trigger_with(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        request.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = self.now();

        let (claim, refused) = self.claim(&request.entities)?;
        let mut outcomes: Vec<EntityOutcome> = refused
            .iter()
            .map(|&entity| {
                warn!(%entity, "Entity already running, refusing trigger");
                EntityOutcome::refused(entity, request.mode)
            })
            .collect();

        let mut states = Vec::with_capacity(claim.entities.len());
        for &entity in &claim.entities {
            match self.begin(entity, request.mode, run_id).await? {
                Some(state) => states.push(state),
                None => outcomes.push(EntityOutcome::refused(entity, request.mode)),
            }
        }

        if states.is_empty() {
            outcomes.sort_by_key(|o| o.entity);
            return Ok(RunReport {
                run_id,
                mode: request.mode,
                started_at,
                completed_at: self.now(),
                outcomes,
            });
        }

        let entities = states.iter().map(|state| state.entity).collect();
        let result = self
            .orchestrator
            .run_with(&request.for_entities(entities), run_id, cancel)
            .await;

        match result {
            Ok(mut report) => {
                for state in states {
                    let status = report
                        .outcome(state.entity)
                        .map(|o| o.status.clone())
                        .unwrap_or(EntityStatus::Succeeded);
                    self.finish(state, &status).await?;
                }
                report.outcomes.append(&mut outcomes);
                report.outcomes.sort_by_key(|o| o.entity);
                Ok(report)
            },
            Err(err) => {
                let status = EntityStatus::Failed {
                    reason: err.to_string(),
                    range: None,
                };
                for state in states {
                    self.finish(state, &status).await?;
                }
                Err(err)
            },
        }
    }

    /// Daemon loop: recover, then fire due cadences every [`TICK_INTERVAL`]
    /// until `shutdown` is cancelled. In-flight runs are cancelled and awaited
    /// before returning.
    pub async fn run_until(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let interrupted = self.recover().await?;
        if !interrupted.is_empty() {
            warn!(entities = ?interrupted, "Marked interrupted runs as failed");
        }

        let started = self.now();
        for cadence in &self.cadences {
            info!(
                cadence = %cadence.name,
                expression = %cadence.expression,
                mode = %cadence.mode,
                next = ?cadence.next_after(started),
                "Cadence registered"
            );
        }
        let mut timetable = Timetable::new(self.cadences.clone(), started);
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut runs = JoinSet::new();

        info!("Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for cadence in timetable.due(self.now()) {
                        info!(cadence = %cadence.name, "Cadence due, triggering run");
                        let scheduler = Arc::clone(&self);
                        let cancel = shutdown.child_token();
                        runs.spawn(async move {
                            match scheduler.trigger_with(&cadence.request(), cancel).await {
                                Ok(report) => info!(
                                    cadence = %cadence.name,
                                    run_id = %report.run_id,
                                    failures = report.has_failures(),
                                    "Scheduled run finished"
                                ),
                                Err(err) => error!(cadence = %cadence.name, error = %err, "Scheduled run failed"),
                            }
                        });
                    }
                    while let Some(joined) = runs.try_join_next() {
                        if let Err(err) = joined {
                            error!(error = %err, "Scheduled run task panicked");
                        }
                    }
                },
            }
        }

        info!(in_flight = runs.len(), "Scheduler stopping");
        while let Some(joined) = runs.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Scheduled run task panicked");
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}
