//! HTTP client for the Chamber of Deputies open data API

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    retry::RetryPolicy,
    types::{Envelope, Page, PageRequest},
    PageSource,
};
use crate::{
    clock::{Sleeper, TokioSleeper},
    config::IngestConfig,
    error::{IngestError, Result},
};

const USER_AGENT: &str = concat!("camara-ingest/", env!("CARGO_PKG_VERSION"));

/// Spaces consecutive requests at least `min_interval` apart
struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    async fn acquire(&self, sleeper: &dyn Sleeper) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleeper.sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A failed attempt plus the server's `Retry-After` hint, if any
struct AttemptFailure {
    error: IngestError,
    retry_after: Option<Duration>,
}

impl From<IngestError> for AttemptFailure {
    fn from(error: IngestError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
    retry: RetryPolicy,
    limiter: RateLimiter,
    sleeper: Arc<dyn Sleeper>,
}

impl ApiClient {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            retry: config.retry_policy(),
            limiter: RateLimiter::new(config.min_request_interval()),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, request: &PageRequest) -> String {
        format!("{}{}", self.base_url, request.endpoint.path())
    }

    async fn attempt(&self, request: &PageRequest) -> std::result::Result<Page, AttemptFailure> {
        let mut query = request.endpoint.query();
        if request.endpoint.is_paginated() {
            query.push(("pagina", request.page.to_string()));
            query.push(("itens", self.page_size.to_string()));
        }

        let response = self
            .http
            .get(self.url(request))
            .header(header::ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .map_err(IngestError::from)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptFailure {
                retry_after: retry_after(response.headers()),
                error: IngestError::Transient(format!(
                    "HTTP {} from {}",
                    status.as_u16(),
                    request.endpoint
                )),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Client {
                status: status.as_u16(),
                message: format!("{}: {}", request.endpoint, truncate(&body, 200)),
            }
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::Transient(format!("Failed to read body: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| {
            IngestError::Decode(format!("{} page {}: {e}", request.endpoint, request.page))
        })?;

        Ok(envelope.into_page(request, self.page_size)?)
    }
}

#[async_trait]
impl PageSource for ApiClient {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire(self.sleeper.as_ref()).await;

            match self.attempt(request).await {
                Ok(page) => {
                    debug!(
                        endpoint = %request.endpoint,
                        page = request.page,
                        records = page.records.len(),
                        has_more = page.has_more,
                        "Fetched page"
                    );
                    return Ok(page);
                },
                Err(failure) if !failure.error.is_retryable() => return Err(failure.error),
                Err(failure) if !self.retry.should_retry(attempt) => {
                    return Err(IngestError::RetriesExhausted {
                        attempts: attempt,
                        last_error: failure.error.to_string(),
                    });
                },
                Err(failure) => {
                    let delay = self.retry.delay_for(attempt, failure.retry_after);
                    warn!(
                        endpoint = %request.endpoint,
                        page = request.page,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "Request failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                },
            }
        }
    }
}

/// `Retry-After` in delta-seconds form
fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
