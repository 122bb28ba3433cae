//! Ingestion configuration
//!
//! Everything is read from the environment (a `.env` file is loaded by the
//! binary first). Unset variables fall back to defaults; set but unparsable
//! variables are rejected instead of silently ignored.

use anyhow::Context;
use camara_common::{types::parse_date, Entity};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr, time::Duration};

use crate::api::RetryPolicy;

pub const DEFAULT_API_BASE_URL: &str = "https://dadosabertos.camara.leg.br/api/v2";
pub const DEFAULT_INCREMENTAL_SCHEDULE: &str = "0 0 2 * * *";
pub const DEFAULT_FULL_SCHEDULE: &str = "0 0 3 * * Sun";

/// Largest page the upstream API serves
pub const MAX_PAGE_SIZE: u32 = 100;

/// Chunks never cross a year, so wider windows change nothing
pub const MAX_WINDOW_DAYS: u32 = 366;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// PostgreSQL connection string; only required by commands that touch the store
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub api_base_url: String,
    pub page_size: u32,
    pub min_request_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Longest date span requested in one chunk
    pub max_window_days: u32,
    /// Default floor for every entity's history
    pub history_start: NaiveDate,
    /// Per-entity overrides of `history_start`
    pub floors: BTreeMap<Entity, NaiveDate>,
    /// Entities running at once inside a dependency wave
    pub concurrency: usize,
    /// Whole-run timeout in seconds, 0 disables it
    pub run_timeout_secs: u64,
    /// Fetch `/deputados/{id}` for every listed deputy
    pub fetch_deputy_details: bool,
    pub incremental_schedule: String,
    pub full_schedule: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            page_size: MAX_PAGE_SIZE,
            min_request_interval_ms: 250,
            http_timeout_secs: 30,
            retry_max_attempts: 5,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            max_window_days: 30,
            history_start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default(),
            floors: BTreeMap::new(),
            concurrency: 2,
            run_timeout_secs: 21_600,
            fetch_deputy_details: true,
            incremental_schedule: DEFAULT_INCREMENTAL_SCHEDULE.to_string(),
            full_schedule: DEFAULT_FULL_SCHEDULE.to_string(),
        }
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let mut floors = BTreeMap::new();
        for entity in Entity::ALL {
            let key = format!("INGEST_FLOOR_{}", entity.as_str().to_uppercase());
            if let Ok(value) = std::env::var(&key) {
                let floor = parse_date(&value).with_context(|| format!("Invalid {key}"))?;
                floors.insert(entity, floor);
            }
        }

        let history_start = match std::env::var("INGEST_HISTORY_START") {
            Ok(value) => parse_date(&value).context("Invalid INGEST_HISTORY_START")?,
            Err(_) => defaults.history_start,
        };

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_or("INGEST_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            api_base_url: std::env::var("CAMARA_API_BASE_URL")
                .unwrap_or(defaults.api_base_url),
            page_size: env_or("INGEST_PAGE_SIZE", defaults.page_size)?,
            min_request_interval_ms: env_or(
                "INGEST_MIN_REQUEST_INTERVAL_MS",
                defaults.min_request_interval_ms,
            )?,
            http_timeout_secs: env_or("INGEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            retry_max_attempts: env_or("INGEST_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay_ms: env_or(
                "INGEST_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: env_or("INGEST_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            max_window_days: env_or("INGEST_MAX_WINDOW_DAYS", defaults.max_window_days)?,
            history_start,
            floors,
            concurrency: env_or("INGEST_CONCURRENCY", defaults.concurrency)?,
            run_timeout_secs: env_or("INGEST_RUN_TIMEOUT_SECS", defaults.run_timeout_secs)?,
            fetch_deputy_details: env_or(
                "INGEST_FETCH_DEPUTY_DETAILS",
                defaults.fetch_deputy_details,
            )?,
            incremental_schedule: std::env::var("INGEST_INCREMENTAL_SCHEDULE")
                .unwrap_or(defaults.incremental_schedule),
            full_schedule: std::env::var("INGEST_FULL_SCHEDULE")
                .unwrap_or(defaults.full_schedule),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            anyhow::bail!("INGEST_PAGE_SIZE must be between 1 and {MAX_PAGE_SIZE}");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("INGEST_RETRY_MAX_ATTEMPTS must be greater than 0");
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("INGEST_RETRY_BASE_DELAY_MS must not exceed INGEST_RETRY_MAX_DELAY_MS");
        }
        if self.max_window_days == 0 || self.max_window_days > MAX_WINDOW_DAYS {
            anyhow::bail!("INGEST_MAX_WINDOW_DAYS must be between 1 and {MAX_WINDOW_DAYS}");
        }
        if self.concurrency == 0 {
            anyhow::bail!("INGEST_CONCURRENCY must be greater than 0");
        }
        if self.db_max_connections == 0 {
            anyhow::bail!("INGEST_DB_MAX_CONNECTIONS must be greater than 0");
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            anyhow::bail!("CAMARA_API_BASE_URL must be an http(s) URL");
        }
        cron::Schedule::from_str(&self.incremental_schedule)
            .context("INGEST_INCREMENTAL_SCHEDULE is not a valid cron expression")?;
        cron::Schedule::from_str(&self.full_schedule)
            .context("INGEST_FULL_SCHEDULE is not a valid cron expression")?;
        Ok(())
    }

    /// Earliest date ingested for `entity`
    pub fn floor(&self, entity: Entity) -> NaiveDate {
        self.floors.get(&entity).copied().unwrap_or(self.history_start)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}='{value}': {e}")),
        Err(_) => Ok(default),
    }
}
