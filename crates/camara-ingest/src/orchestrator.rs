//! Extraction orchestrator
//!
//! For every requested entity the orchestrator plans a date range (full or
//! incremental), splits it into chunks and drives the page source, the
//! transformer and the loader through each chunk strictly sequentially. The
//! watermark advances only after a chunk's batches have committed.
//!
//! Entities run in dependency waves (parents first). Inside a wave they run
//! concurrently, bounded by `concurrency`, and a failing entity never aborts
//! its siblings.

use camara_common::{CamaraError, DateRange, Entity, EntitySelector, IngestMode};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    api::{Endpoint, Page, PageRequest, PageSource},
    clock::{Clock, SystemClock},
    config::IngestConfig,
    error::{IngestError, Result},
    loader::{Loader, SkippedRow},
    models::{Batch, Record},
    report::{EntityOutcome, EntityStats, EntityStatus, RunReport},
    transform::{
        transform_all, transform_deputy, transform_expense, transform_speech, transform_vote,
        transform_voting_session, TransformWarning, Transformed,
    },
    watermark::{Advance, WatermarkKey, WatermarkStore},
};

/// What to ingest and over which dates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: IngestMode,
    pub entities: Vec<Entity>,
    /// Explicit first day; takes precedence over `days`
    pub start: Option<NaiveDate>,
    /// Explicit last day, defaults to today
    pub end: Option<NaiveDate>,
    /// Incremental shorthand: start = today - days
    pub days: Option<u32>,
}

impl RunRequest {
    pub fn new(mode: IngestMode, selector: EntitySelector) -> Self {
        Self {
            mode,
            entities: selector.entities(),
            start: None,
            end: None,
            days: None,
        }
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn last_days(mut self, days: u32) -> Self {
        self.days = Some(days);
        self
    }

    /// Same request restricted to `entities`
    pub fn for_entities(&self, entities: Vec<Entity>) -> Self {
        Self {
            entities,
            ..self.clone()
        }
    }

    /// Reject requests that can never be satisfied
    pub fn validate(&self) -> camara_common::Result<()> {
        if self.entities.is_empty() {
            return Err(CamaraError::InvalidRequest("no entity selected".to_string()));
        }
        if self.days.is_some() && self.mode == IngestMode::Full {
            return Err(CamaraError::InvalidRequest(
                "a day count only applies to incremental runs".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            DateRange::new(start, end)?;
        }
        Ok(())
    }
}

/// Orchestrator knobs, taken from [`IngestConfig`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub history_start: NaiveDate,
    pub floors: BTreeMap<Entity, NaiveDate>,
    pub max_window_days: u32,
    pub concurrency: usize,
    pub run_timeout: Option<Duration>,
    pub fetch_deputy_details: bool,
}

impl OrchestratorSettings {
    pub fn floor(&self, entity: Entity) -> NaiveDate {
        self.floors.get(&entity).copied().unwrap_or(self.history_start)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for OrchestratorSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            history_start: config.history_start,
            floors: config.floors.clone(),
            max_window_days: config.max_window_days,
            concurrency: config.concurrency,
            run_timeout: config.run_timeout(),
            fetch_deputy_details: config.fetch_deputy_details,
        }
    }
}

pub struct ExtractionOrchestrator {
    source: Arc<dyn PageSource>,
    loader: Arc<dyn Loader>,
    watermarks: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl ExtractionOrchestrator {
    pub fn new(
        source: Arc<dyn PageSource>,
        loader: Arc<dyn Loader>,
        watermarks: Arc<dyn WatermarkStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            loader,
            watermarks,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Date range `entity` would cover for `request`.
    ///
    /// `Ok(None)` means the computed start lies after the end (the watermark
    /// is already ahead), which is a successful no-op. An explicit start
    /// after the end is invalid input.
    pub async fn plan(&self, entity: Entity, request: &RunRequest) -> Result<Option<DateRange>> {
        let today = self.clock.today();
        let floor = self.settings.floor(entity);
        let end = request.end.unwrap_or(today);

        let start = match (request.mode, request.start, request.days) {
            (_, Some(start), _) => start,
            (IngestMode::Full, None, _) => floor,
            (IngestMode::Incremental, None, Some(days)) => today
                .checked_sub_days(chrono::Days::new(u64::from(days)))
                .ok_or_else(|| {
                    CamaraError::InvalidRequest(format!("{days} days reaches before the calendar"))
                })?,
            (IngestMode::Incremental, None, None) => {
                match self.watermarks.get(&WatermarkKey::entity(entity)).await? {
                    Some(watermark) => watermark.max(floor),
                    None => floor,
                }
            },
        };

        if start > end {
            if request.start.is_some() {
                return Err(CamaraError::InvalidDateRange { start, end }.into());
            }
            return Ok(None);
        }
        Ok(Some(DateRange::new(start, end)?))
    }

    pub async fn run(&self, request: &RunRequest) -> Result<RunReport> {
        self.run_with(request, Uuid::new_v4(), CancellationToken::new())
            .await
    }

    /// Run `request` under `run_id`; cancelling `cancel` stops every entity
    /// before its next page.
    #[instrument(skip_all, fields(run_id = %run_id, mode = %request.mode))]
    pub async fn run_with(
        &self,
        request: &RunRequest,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        request.validate()?;
        let started_at = self.clock.now();
        let cancel = cancel.child_token();

        info!(
            entities = ?request.entities,
            start = ?request.start,
            end = ?request.end,
            days = ?request.days,
            "Starting ingestion run"
        );

        let timer = self.settings.run_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout_secs = timeout.as_secs(), "Run timed out, cancelling");
                cancel.cancel();
            })
        });

        let mut outcomes = Vec::with_capacity(request.entities.len());
        for wave in Entity::dependency_waves(&request.entities) {
            let finished: Vec<EntityOutcome> = stream::iter(wave)
                .map(|entity| self.run_entity(entity, request, &cancel))
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;
            outcomes.extend(finished);
        }
        outcomes.sort_by_key(|o| o.entity);

        if let Some(timer) = timer {
            timer.abort();
        }

        let report = RunReport {
            run_id,
            mode: request.mode,
            started_at,
            completed_at: self.clock.now(),
            outcomes,
        };
        let totals = report.totals();
        info!(
            upserted = totals.upserted,
            skipped = totals.skipped,
            failed = report.outcomes.iter().filter(|o| o.status.is_failure()).count(),
            "Ingestion run finished"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(entity = %entity))]
    async fn run_entity(
        &self,
        entity: Entity,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> EntityOutcome {
        let mut job = EntityJob::new(self, entity, cancel);

        let range = match self.plan(entity, request).await {
            Ok(range) => range,
            Err(err) => {
                error!(error = %err, "Failed to plan date range");
                return job.finish(request.mode, None, Err(err));
            },
        };

        let Some(range) = range else {
            info!("Watermark is past the requested end, nothing to ingest");
            return job.finish(request.mode, None, Ok(()));
        };

        info!(%range, "Ingesting entity");
        let result = job.execute(request.mode, range).await;
        job.finish(request.mode, Some(range), result)
    }
}

/// State of one entity's extraction within a run
struct EntityJob<'a> {
    source: &'a dyn PageSource,
    loader: &'a dyn Loader,
    watermarks: &'a dyn WatermarkStore,
    settings: &'a OrchestratorSettings,
    cancel: &'a CancellationToken,
    entity: Entity,
    key: WatermarkKey,
    stats: EntityStats,
    skipped: Vec<SkippedRow>,
    /// Range being processed, for failure attribution
    current: Option<DateRange>,
}

impl<'a> EntityJob<'a> {
    fn new(
        orchestrator: &'a ExtractionOrchestrator,
        entity: Entity,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source: orchestrator.source.as_ref(),
            loader: orchestrator.loader.as_ref(),
            watermarks: orchestrator.watermarks.as_ref(),
            settings: &orchestrator.settings,
            cancel,
            entity,
            key: WatermarkKey::entity(entity),
            stats: EntityStats::new(),
            skipped: Vec::new(),
            current: None,
        }
    }

    async fn execute(&mut self, mode: IngestMode, range: DateRange) -> Result<()> {
        if mode == IngestMode::Full {
            self.watermarks.reset(&self.key, range.start()).await?;
        }

        let deputy_ids = match self.entity {
            Entity::Expenses | Entity::Speeches => {
                let ids = self.loader.deputy_ids().await?;
                if ids.is_empty() {
                    warn!("No deputies stored yet, nothing to fan out over");
                }
                ids
            },
            _ => Vec::new(),
        };

        // the deputy list has no date filter and is fetched whole
        let chunks = if self.entity.is_date_filtered() {
            range.chunks(self.settings.max_window_days)
        } else {
            vec![range]
        };

        for chunk in chunks {
            self.current = Some(chunk);
            debug!(%chunk, "Processing chunk");
            match self.entity {
                Entity::Deputies => self.deputies().await?,
                Entity::VotingSessions => {
                    self.paginate(Endpoint::VotingSessions { range: chunk }, transform_voting_session)
                        .await?
                },
                Entity::Votes => self.votes(chunk).await?,
                Entity::Expenses => {
                    for &deputy_id in &deputy_ids {
                        for (year, month) in chunk.months() {
                            self.paginate(
                                Endpoint::Expenses {
                                    deputy_id,
                                    year,
                                    month,
                                },
                                move |raw| transform_expense(raw, deputy_id),
                            )
                            .await?;
                        }
                    }
                },
                Entity::Speeches => {
                    for &deputy_id in &deputy_ids {
                        self.paginate(
                            Endpoint::Speeches {
                                deputy_id,
                                range: chunk,
                            },
                            move |raw| transform_speech(raw, deputy_id),
                        )
                        .await?;
                    }
                },
            }
            self.commit(chunk).await?;
        }
        Ok(())
    }

    /// Deputy list, one batch per page, optionally enriched with detail records
    async fn deputies(&mut self) -> Result<()> {
        let mut request = PageRequest::first(Endpoint::Deputies);
        loop {
            let page = self.fetch(&request).await?;
            let mut listed = transform_all(&page.records, transform_deputy);
            if self.settings.fetch_deputy_details {
                listed = self.with_details(listed).await?;
            }
            self.load(listed).await?;

            if !page.has_more {
                return Ok(());
            }
            request = request.next();
        }
    }

    async fn with_details(&mut self, listed: Transformed) -> Result<Transformed> {
        let mut enriched = Transformed {
            records: Vec::with_capacity(listed.records.len()),
            warnings: listed.warnings,
        };

        for record in listed.records {
            let deputy = match record {
                Record::Deputy(deputy) => deputy,
                other => {
                    enriched.records.push(other);
                    continue;
                },
            };
            let id = deputy.id;

            match self.fetch(&PageRequest::first(Endpoint::DeputyDetail(id))).await {
                Ok(page) => {
                    let detail = transform_all(&page.records, transform_deputy);
                    if detail.records.is_empty() {
                        enriched.warnings.extend(detail.warnings);
                        enriched.records.push(Record::Deputy(deputy));
                    } else {
                        enriched.extend(detail);
                    }
                },
                Err(IngestError::Client { status, message }) => {
                    warn!(deputy_id = id, status, %message, "Deputy detail unavailable, keeping list record");
                    enriched.warnings.push(TransformWarning {
                        entity: Entity::Deputies,
                        field: "detail",
                        detail: format!("detail request for {id} failed with HTTP {status}"),
                    });
                    enriched.records.push(Record::Deputy(deputy));
                },
                Err(err) => return Err(err),
            }
        }
        Ok(enriched)
    }

    /// Voting sessions of `chunk` with their votes; each sessions page and its
    /// votes form one batch with the sessions as parents.
    async fn votes(&mut self, chunk: DateRange) -> Result<()> {
        let mut request = PageRequest::first(Endpoint::VotingSessions { range: chunk });
        loop {
            let page = self.fetch(&request).await?;
            let mut batch = transform_all(&page.records, transform_voting_session);

            let session_ids: Vec<String> = batch
                .records
                .iter()
                .filter_map(|record| match record {
                    Record::VotingSession(session) => Some(session.id.clone()),
                    _ => None,
                })
                .collect();

            for session_id in session_ids {
                let mut votes_request = PageRequest::first(Endpoint::Votes {
                    session_id: session_id.clone(),
                });
                loop {
                    let votes = self.fetch(&votes_request).await?;
                    batch.extend(transform_all(&votes.records, |raw| {
                        transform_vote(raw, &session_id)
                    }));
                    if !votes.has_more {
                        break;
                    }
                    votes_request = votes_request.next();
                }
            }

            self.load(batch).await?;

            if !page.has_more {
                return Ok(());
            }
            request = request.next();
        }
    }

    /// Fetch every page of `endpoint`, loading each before requesting the next
    async fn paginate<F>(&mut self, endpoint: Endpoint, transform: F) -> Result<()>
    where
        F: Fn(&Value) -> Transformed,
    {
        let mut request = PageRequest::first(endpoint);
        loop {
            let page = self.fetch(&request).await?;
            self.load(transform_all(&page.records, &transform)).await?;

            if !page.has_more {
                return Ok(());
            }
            request = request.next();
        }
    }

    async fn fetch(&mut self, request: &PageRequest) -> Result<Page> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let page = self.source.fetch_page(request).await?;
        self.stats.pages += 1;
        self.stats.records_fetched += page.records.len();
        Ok(page)
    }

    async fn load(&mut self, transformed: Transformed) -> Result<()> {
        for warning in &transformed.warnings {
            warn!(%warning, "Transform warning");
        }
        self.stats.warnings += transformed.warnings.len();

        if transformed.records.is_empty() {
            return Ok(());
        }

        let batch = Batch::new(self.entity, transformed.records);
        let report = self.loader.upsert_batch(&batch).await?;
        self.stats.upserted += report.upserted;
        self.stats.skipped += report.skipped.len();
        self.skipped.extend(report.skipped);
        Ok(())
    }

    async fn commit(&mut self, chunk: DateRange) -> Result<()> {
        match self.watermarks.advance(&self.key, chunk.end()).await? {
            Advance::Advanced => debug!(cursor = %chunk.end(), "Watermark advanced"),
            Advance::Rejected { current } => {
                info!(%current, requested = %chunk.end(), "Watermark already ahead of chunk")
            },
        }
        self.stats.chunks_committed += 1;
        Ok(())
    }

    fn finish(
        mut self,
        mode: IngestMode,
        range: Option<DateRange>,
        result: Result<()>,
    ) -> EntityOutcome {
        self.stats.complete();

        let status = match result {
            Ok(()) if self.skipped.is_empty() => EntityStatus::Succeeded,
            Ok(()) => EntityStatus::PartiallySucceeded {
                skipped: self.skipped.len(),
            },
            Err(err) => {
                error!(
                    range = ?self.current,
                    error = %err,
                    "Entity ingestion failed"
                );
                EntityStatus::Failed {
                    reason: err.to_string(),
                    range: self.current,
                }
            },
        };

        info!(
            pages = self.stats.pages,
            upserted = self.stats.upserted,
            skipped = self.stats.skipped,
            warnings = self.stats.warnings,
            chunks = self.stats.chunks_committed,
            duration_secs = self.stats.duration_secs,
            %status,
            "Entity ingestion finished"
        );

        EntityOutcome {
            entity: self.entity,
            mode,
            range,
            status,
            stats: self.stats,
            skipped_rows: self.skipped,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{clock::FixedClock, loader::InMemoryStore, watermark::MemoryWatermarkStore};
    use async_trait::async_trait;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct EmptySource;

    #[async_trait]
    impl PageSource for EmptySource {
        fn page_size(&self) -> u32 {
            100
        }

        async fn fetch_page(&self, _request: &PageRequest) -> Result<Page> {
            Ok(Page::default())
        }
    }

    fn orchestrator(watermarks: Arc<MemoryWatermarkStore>, today: NaiveDate) -> ExtractionOrchestrator {
        let settings = OrchestratorSettings {
            history_start: date(2023, 1, 1),
            ..OrchestratorSettings::default()
        };
        ExtractionOrchestrator::new(
            Arc::new(EmptySource),
            Arc::new(InMemoryStore::new()),
            watermarks,
            settings,
        )
        .with_clock(Arc::new(FixedClock::at_date(today)))
    }

    #[test]
    fn test_request_validation() {
        let request = RunRequest::new(IngestMode::Full, EntitySelector::All).last_days(3);
        assert!(matches!(
            request.validate(),
            Err(CamaraError::InvalidRequest(_))
        ));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::All)
            .between(Some(date(2024, 2, 1)), Some(date(2024, 1, 1)));
        assert!(matches!(
            request.validate(),
            Err(CamaraError::InvalidDateRange { .. })
        ));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::All).last_days(7);
        assert!(request.validate().is_ok());
    }

    #[tokio::test]
    async fn test_plan_incremental_uses_watermark_over_floor() {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        watermarks
            .advance(&WatermarkKey::entity(Entity::Votes), date(2024, 1, 10))
            .await
            .unwrap();
        let orchestrator = orchestrator(watermarks, date(2024, 1, 15));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::One(Entity::Votes));
        let range = orchestrator.plan(Entity::Votes, &request).await.unwrap();
        assert_eq!(range, Some(DateRange::new(date(2024, 1, 10), date(2024, 1, 15)).unwrap()));

        // no watermark: entity floor
        let range = orchestrator.plan(Entity::Speeches, &request).await.unwrap();
        assert_eq!(range.unwrap().start(), date(2023, 1, 1));
    }

    #[tokio::test]
    async fn test_plan_explicit_start_beats_days() {
        let orchestrator = orchestrator(Arc::new(MemoryWatermarkStore::new()), date(2024, 3, 31));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::One(Entity::Votes))
            .last_days(7);
        let range = orchestrator.plan(Entity::Votes, &request).await.unwrap().unwrap();
        assert_eq!(range.start(), date(2024, 3, 24));

        let request = request.between(Some(date(2024, 3, 1)), None);
        let range = orchestrator.plan(Entity::Votes, &request).await.unwrap().unwrap();
        assert_eq!(range.start(), date(2024, 3, 1));
        assert_eq!(range.end(), date(2024, 3, 31));
    }

    #[tokio::test]
    async fn test_plan_rejects_day_count_before_the_calendar() {
        let orchestrator = orchestrator(Arc::new(MemoryWatermarkStore::new()), date(2024, 3, 31));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::One(Entity::Votes))
            .last_days(200_000_000);
        assert!(request.validate().is_ok());

        let err = orchestrator.plan(Entity::Votes, &request).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Domain(CamaraError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_plan_full_ignores_watermark() {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        watermarks
            .advance(&WatermarkKey::entity(Entity::Expenses), date(2024, 6, 1))
            .await
            .unwrap();
        let orchestrator = orchestrator(watermarks, date(2024, 6, 2));

        let request = RunRequest::new(IngestMode::Full, EntitySelector::One(Entity::Expenses));
        let range = orchestrator.plan(Entity::Expenses, &request).await.unwrap().unwrap();
        assert_eq!(range.start(), date(2023, 1, 1));
    }

    #[tokio::test]
    async fn test_plan_watermark_ahead_is_noop() {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        watermarks
            .advance(&WatermarkKey::entity(Entity::Votes), date(2024, 5, 1))
            .await
            .unwrap();
        let orchestrator = orchestrator(watermarks, date(2024, 5, 10));

        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::One(Entity::Votes))
            .between(None, Some(date(2024, 4, 1)));
        assert_eq!(orchestrator.plan(Entity::Votes, &request).await.unwrap(), None);

        // an explicit start after the default end is invalid input
        let request = RunRequest::new(IngestMode::Incremental, EntitySelector::One(Entity::Votes))
            .between(Some(date(2024, 6, 1)), None);
        let err = orchestrator.plan(Entity::Votes, &request).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Domain(CamaraError::InvalidDateRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_range_still_advances_watermark() {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        let orchestrator = orchestrator(watermarks.clone(), date(2024, 1, 15));

        let request = RunRequest::new(
            IngestMode::Incremental,
            EntitySelector::One(Entity::VotingSessions),
        )
        .between(Some(date(2024, 1, 1)), None);
        let report = orchestrator.run(&request).await.unwrap();

        let outcome = report.outcome(Entity::VotingSessions).unwrap();
        assert_eq!(outcome.status, EntityStatus::Succeeded);
        assert_eq!(outcome.stats.pages, 1);
        assert_eq!(
            watermarks
                .get(&WatermarkKey::entity(Entity::VotingSessions))
                .await
                .unwrap(),
            Some(date(2024, 1, 15))
        );
    }
}
