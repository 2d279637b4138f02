//! Source API contract, payload validation and rate-limited fetching.

use async_trait::async_trait;
use deltasync_core::PageRequest;

pub mod client;
pub mod error;
pub mod fetcher;
pub mod memory;
pub mod wire;

pub use client::{HttpSourceApi, SourceApiConfig};
pub use error::{classify_reqwest_error, classify_status, SourceError};
pub use fetcher::{BatchFetcher, FetchFailure, FetchOutcome, FetcherConfig, RateLimit};
pub use memory::MemorySource;
pub use wire::{AttributePage, ListPage, RejectedRecord};

pub const CRATE_NAME: &str = "deltasync-source";

/// Paginated source of records plus their sparse attributes.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn list_page(&self, page: PageRequest) -> Result<ListPage, SourceError>;

    async fn fetch_attributes(&self, owner_ids: &[String]) -> Result<AttributePage, SourceError>;

    /// Row limit sent with each attribute request. A response holding this many
    /// rows may have been cut short.
    fn attribute_limit(&self) -> usize;
}
