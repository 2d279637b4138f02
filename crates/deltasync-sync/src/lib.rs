//! Incremental sync pipeline: config, change tracking, projection, writes and
//! run orchestration.

use std::sync::Arc;

use anyhow::{Context, Result};
use deltasync_core::{SyncOptions, SyncSummary};
use deltasync_source::HttpSourceApi;
use deltasync_store::PgStore;

pub mod config;
pub mod orchestrator;
pub mod projection;
pub mod reports;
pub mod scheduler;
pub mod tracker;
pub mod writer;

pub use config::{ConfigError, SyncConfig};
pub use orchestrator::{decide_status, SyncEngine, TriggerError};
pub use projection::{normalize, FieldProjection, ProjectionOutcome};
pub use reports::{report_markdown, write_reports};
pub use scheduler::maybe_build_scheduler;
pub use tracker::{ChangeTracker, ClassifiedRecord, Classification, PersistReport};
pub use writer::{FailedBatch, UpsertWriter, WriteReport, WriterConfig};

pub const CRATE_NAME: &str = "deltasync-sync";

/// Connect the Postgres store and HTTP source described by `config`.
pub async fn build_engine(config: SyncConfig) -> Result<SyncEngine> {
    config.validate().context("validating sync configuration")?;
    let source = HttpSourceApi::new(config.source_api_config()?).context("building source client")?;
    let store = PgStore::connect(&config.pg_store_config()?)
        .await
        .context("connecting to postgres")?;
    Ok(SyncEngine::new(config, Arc::new(source), Arc::new(store)))
}

pub async fn engine_from_env() -> Result<SyncEngine> {
    build_engine(SyncConfig::from_env()?).await
}

pub async fn run_sync_once_from_env(options: SyncOptions) -> Result<SyncSummary> {
    let engine = engine_from_env().await?;
    Ok(engine.run_once(options).await)
}
