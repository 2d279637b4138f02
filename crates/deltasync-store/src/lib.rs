//! Persistence contracts for fingerprints, entities and the run ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use deltasync_core::{NormalizedEntity, SyncRun, TrackingFingerprint};

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, StoredEntity};
pub use postgres::{PgStore, PgStoreConfig};

pub const CRATE_NAME: &str = "deltasync-store";

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Fingerprints for the ids that have one; absent ids are simply missing
    /// from the map. An `Err` means the lookup itself failed.
    async fn load_fingerprints(
        &self,
        record_ids: &[String],
    ) -> StoreResult<HashMap<String, TrackingFingerprint>>;

    /// Insert-or-update keyed by `record_id`. `last_seen_modified_at` never
    /// moves backwards.
    async fn upsert_fingerprints(&self, rows: &[TrackingFingerprint]) -> StoreResult<u64>;

    async fn clear_fingerprints(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert-or-update keyed by `business_id`, as one atomic statement.
    async fn upsert_entities(&self, batch: &[NormalizedEntity]) -> StoreResult<u64>;

    async fn delete_all_entities(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn start_run(&self, run: &SyncRun) -> StoreResult<()>;

    async fn finish_run(&self, run: &SyncRun) -> StoreResult<()>;

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>>;
}

/// Everything the orchestrator needs from one backing store.
pub trait SyncStore: FingerprintStore + EntityStore + RunLedger {}

impl<T: FingerprintStore + EntityStore + RunLedger> SyncStore for T {}
