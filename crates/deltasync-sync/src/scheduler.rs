//! Cron trigger for unattended runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use deltasync_core::SyncOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::SyncEngine;

/// Build a scheduler that triggers an exclusive run on the configured cron
/// expression. Returns `None` when scheduling is disabled. The caller starts it.
pub async fn maybe_build_scheduler(engine: Arc<SyncEngine>) -> Result<Option<JobScheduler>> {
    if !engine.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = engine.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            match engine.run_exclusive(SyncOptions::default()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = summary.status.as_str(),
                    "scheduled sync finished"
                ),
                Err(err) => warn!(%err, "scheduled sync skipped"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
