//! Sync run orchestration: plan, list, classify, project, write, finalize.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use deltasync_core::{
    plan_pages, ChangeReason, PageRequest, RunStatus, SourceRecord, SyncOptions, SyncPhase,
    SyncRun, SyncSummary, Throughput,
};
use deltasync_source::{BatchFetcher, SourceApi};
use deltasync_store::{EntityStore, FingerprintStore, RunLedger, StoreResult, SyncStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::projection::FieldProjection;
use crate::reports::write_reports;
use crate::tracker::{ChangeTracker, Classification};
use crate::writer::UpsertWriter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("a sync run is already in progress")]
    RunInProgress,
}

/// Reason a run stopped before reaching the write stage.
#[derive(Debug)]
struct Abort(String);

pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn SourceApi>,
    store: Arc<dyn SyncStore>,
    run_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, source: Arc<dyn SourceApi>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            config,
            source,
            store,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Newest ledger rows first.
    pub async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>> {
        self.store.recent_runs(limit).await
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Start a run unless one is already active.
    pub async fn run_exclusive(&self, options: SyncOptions) -> Result<SyncSummary, TriggerError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| TriggerError::RunInProgress)?;
        Ok(self.execute(options).await)
    }

    /// Run once, waiting for any active run to finish first.
    pub async fn run_once(&self, options: SyncOptions) -> SyncSummary {
        let _guard = self.run_lock.lock().await;
        self.execute(options).await
    }

    async fn execute(&self, options: SyncOptions) -> SyncSummary {
        let run_id = Uuid::new_v4();
        let clock = Instant::now();
        let mut summary = SyncSummary::new(run_id, options, Utc::now());
        let span = info_span!("sync_run", %run_id);

        async {
            if let Err(err) = self.config.validate() {
                warn!(%err, "configuration rejected; run not started");
                summary.error_message = Some(err.to_string());
                self.conclude(&mut summary, clock, RunStatus::Failed, false).await;
                return;
            }

            let ledger_started = match self
                .store
                .start_run(&SyncRun::started(run_id, summary.started_at, summary.options.clone()))
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "could not record run start in the ledger");
                    summary.errors.ledger_writes_failed += 1;
                    summary.error_message = Some(format!("run ledger unavailable: {err}"));
                    false
                }
            };

            let deadline = self.config.run_timeout().map(|timeout| clock + timeout);
            let status = match self.drive(&mut summary, deadline).await {
                Ok(()) => decide_status(&summary),
                Err(Abort(message)) => {
                    warn!(%message, "run aborted");
                    summary.error_message = Some(message);
                    RunStatus::Failed
                }
            };
            self.conclude(&mut summary, clock, status, ledger_started).await;
        }
        .instrument(span)
        .await;

        summary
    }

    async fn drive(&self, summary: &mut SyncSummary, deadline: Option<Instant>) -> Result<(), Abort> {
        let options = summary.options.clone();
        let source = self.source.as_ref();
        // One fetcher per run so every stage draws on the same rate budget.
        let fetcher = BatchFetcher::new(self.config.fetcher_config());

        summary.phases.push(SyncPhase::Planning);
        let probe = fetcher
            .fetch_all(vec![PageRequest { offset: 0, limit: 1 }], deadline, |page| {
                source.list_page(page)
            })
            .await;
        let total_available = match (probe.successes.into_iter().next(), probe.failures.into_iter().next()) {
            (Some((_, page)), _) => page.total,
            (None, Some(failure)) => {
                return Err(Abort(format!("probe request failed: {}", failure.error)));
            }
            (None, None) => return Err(Abort("run deadline reached before probing the source".into())),
        };
        summary.total_available = total_available;

        let plan = plan_pages(
            total_available,
            self.config.page_size,
            options.hard_cap(self.config.max_records),
        );
        info!(
            total_available,
            effective_total = plan.effective_total,
            pages = plan.pages.len(),
            "pages planned"
        );

        if options.clear_first {
            if options.dry_run {
                info!("dry run; skipping destructive clear");
            } else {
                let entities = self
                    .store
                    .delete_all_entities()
                    .await
                    .map_err(|err| Abort(format!("clearing entities failed: {err}")))?;
                let fingerprints = self
                    .store
                    .clear_fingerprints()
                    .await
                    .map_err(|err| Abort(format!("clearing fingerprints failed: {err}")))?;
                warn!(entities, fingerprints, "entity and fingerprint tables cleared");
            }
        }

        if plan.is_empty() {
            summary.phases.push(SyncPhase::EarlyExit);
            return Ok(());
        }

        summary.phases.push(SyncPhase::Listing);
        let listed = fetcher
            .fetch_all(plan.pages, deadline, |page| source.list_page(page))
            .await;
        if let Some(fatal) = listed.fatal_error() {
            return Err(Abort(format!("listing aborted: {fatal}")));
        }
        summary.deadline_exceeded |= listed.deadline_hit;
        summary.errors.list_pages_failed = listed.failures.len();
        summary.errors.list_pages_skipped = listed.skipped.len();
        if listed.successes.is_empty() {
            let message = match (listed.failures.len(), listed.skipped.len()) {
                (0, skipped) => format!("run deadline reached before any of {skipped} list pages was fetched"),
                (failed, 0) => format!("all {failed} list pages failed"),
                (failed, skipped) => {
                    format!("no list page fetched: {failed} failed, {skipped} skipped at the run deadline")
                }
            };
            return Err(Abort(message));
        }

        let mut fetched = Vec::new();
        for (_, page) in listed.successes {
            for rejected in &page.rejected {
                warn!(id = ?rejected.id, reason = %rejected.reason, "rejected source record");
            }
            summary.errors.invalid_records += page.rejected.len();
            fetched.extend(page.records);
        }
        let fetched = collapse_by_id(fetched);
        summary.total_fetched = fetched.len();

        summary.phases.push(SyncPhase::Classifying);
        let classification = if options.force_full_run {
            Classification::force_all(fetched)
        } else {
            ChangeTracker::new(self.store.as_ref()).classify(fetched).await
        };
        summary.tracker_failed_open = classification.failed_open;
        summary.new_records = classification.count(ChangeReason::New);
        summary.modified_records = classification.count(ChangeReason::Modified);
        summary.unchanged_records = classification.skipped.len();
        summary.to_process = classification.to_process.len();

        if classification.to_process.is_empty() {
            info!("nothing to process");
            summary.phases.push(SyncPhase::EarlyExit);
            return Ok(());
        }

        summary.phases.push(SyncPhase::Projecting);
        let projected = FieldProjection::new(source, &fetcher, self.config.attribute_ids_per_request)
            .project(&classification.to_process, deadline)
            .await;
        if let Some(fatal) = projected.fatal {
            return Err(Abort(format!("attribute fetch aborted: {fatal}")));
        }
        summary.deadline_exceeded |= projected.deadline_hit;
        summary.errors.attribute_requests_failed = projected.requests_failed;
        summary.errors.attribute_pages_truncated = projected.pages_truncated;
        summary.errors.attributes_rejected = projected.attributes_rejected;
        summary.errors.projection_dropped = projected.dropped_ids.len();

        if options.dry_run {
            info!(entities = projected.entities.len(), "dry run; skipping writes");
            return Ok(());
        }

        summary.phases.push(SyncPhase::Writing);
        let writer_config = self.config.writer_config();
        let report = UpsertWriter::new(self.store.as_ref(), writer_config)
            .write(projected.entities, deadline)
            .await;
        summary.total_written = report.written_count;
        summary.errors.batches_failed = report.failed_batches.len();
        summary.errors.transient_write_errors = report.transient_errors;
        summary.final_wave_width = report.final_wave_width;
        summary.deadline_exceeded |= report.deadline_hit;

        summary.phases.push(SyncPhase::Finalizing);
        let persisted = ChangeTracker::new(self.store.as_ref())
            .persist(
                &report.written,
                Utc::now(),
                self.config.write_batch_size,
                &writer_config.retry,
            )
            .await;
        summary.fingerprints_persisted = persisted.persisted;
        summary.errors.fingerprint_batches_failed = persisted.failed_batches;
        summary.errors.transient_write_errors += persisted.transient_errors;
        Ok(())
    }

    async fn conclude(
        &self,
        summary: &mut SyncSummary,
        clock: Instant,
        status: RunStatus,
        ledger_started: bool,
    ) {
        let elapsed = clock.elapsed();
        summary.status = status;
        summary.completed_at = Utc::now();
        summary.elapsed_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            summary.throughput = Throughput {
                fetched_per_sec: summary.total_fetched as f64 / secs,
                written_per_sec: summary.total_written as f64 / secs,
            };
        }
        let past_preflight = summary.phases.len() > 1;
        if past_preflight && summary.phases.last() != Some(&SyncPhase::Finalizing) {
            summary.phases.push(SyncPhase::Finalizing);
        }
        summary.phases.push(SyncPhase::from(status));

        if ledger_started {
            if let Err(err) = self.store.finish_run(&SyncRun::finished_from(summary)).await {
                warn!(%err, "could not record run completion in the ledger");
                summary.errors.ledger_writes_failed += 1;
                if summary.error_message.is_none() {
                    summary.error_message = Some(format!("run ledger unavailable: {err}"));
                }
                if summary.status == RunStatus::Completed {
                    summary.status = RunStatus::CompletedWithErrors;
                    if let Some(last) = summary.phases.last_mut() {
                        *last = SyncPhase::CompletedWithErrors;
                    }
                }
            }
        }
        if let Some(root) = self.config.reports_root() {
            if let Err(err) = write_reports(&root, summary).await {
                warn!(error = %err, "writing run reports failed");
            }
        }

        info!(
            status = summary.status.as_str(),
            fetched = summary.total_fetched,
            to_process = summary.to_process,
            written = summary.total_written,
            elapsed_ms = summary.elapsed_ms,
            "sync run finished"
        );
    }
}

/// Terminal status for a run that reached the end of its stages.
pub fn decide_status(summary: &SyncSummary) -> RunStatus {
    let incomplete = summary.errors.has_unrecovered() || summary.deadline_exceeded;
    let expected_writes = summary.to_process > 0 && !summary.options.dry_run;
    if expected_writes && summary.total_written == 0 && incomplete {
        RunStatus::Failed
    } else if incomplete {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::Completed
    }
}

/// A record seen on two pages keeps the copy with the later modification time.
fn collapse_by_id(records: Vec<SourceRecord>) -> Vec<SourceRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<SourceRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.entry(record.id.clone()) {
            Entry::Occupied(slot) => {
                let kept = &mut out[*slot.get()];
                if record.last_modified_at > kept.last_modified_at {
                    *kept = record;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(record);
            }
        }
    }
    out
}
