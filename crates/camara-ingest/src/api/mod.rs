//! Upstream API access
//!
//! [`PageSource`] is the seam between the orchestrator and the network:
//! [`ApiClient`] implements it over HTTP, tests substitute simulated sources.

pub mod client;
pub mod retry;
pub mod types;

use async_trait::async_trait;

pub use client::ApiClient;
pub use retry::RetryPolicy;
pub use types::{Endpoint, Page, PageRequest};

use crate::error::Result;

/// Source of raw record pages
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Records requested per page (`itens`)
    fn page_size(&self) -> u32;

    /// Fetch one page, retrying transient failures internally
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;
}
