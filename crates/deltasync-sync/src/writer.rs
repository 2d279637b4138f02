//! Batched upsert writer. Batches run in concurrent waves; sustained
//! contention narrows the wave width for the rest of the run.

use std::time::Duration;

use deltasync_core::{dedup_last_wins, retry_with_backoff, BackoffPolicy, NormalizedEntity};
use deltasync_store::{EntityStore, StoreError};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub initial_wave_width: usize,
    pub retry: BackoffPolicy,
    /// Transient errors tolerated before the wave width is halved.
    pub contention_threshold: usize,
    /// Pause between waves per transient error seen in the previous wave.
    pub pacing_per_error: Duration,
    pub max_pacing: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            initial_wave_width: 4,
            retry: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_jitter: Duration::from_secs(1),
            },
            contention_threshold: 3,
            pacing_per_error: Duration::from_millis(50),
            max_pacing: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatch {
    pub index: usize,
    pub business_ids: Vec<String>,
    pub attempts: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written_count: usize,
    /// Entities whose batch committed, handed back for fingerprinting.
    pub written: Vec<NormalizedEntity>,
    pub failed_batches: Vec<FailedBatch>,
    /// Width of every wave that ran, in order.
    pub wave_widths: Vec<usize>,
    pub transient_errors: usize,
    pub final_wave_width: usize,
    /// Batches never started because the run deadline passed.
    pub batches_skipped: usize,
    pub deadline_hit: bool,
}

pub struct UpsertWriter<'a, S: ?Sized> {
    store: &'a S,
    config: WriterConfig,
}

impl<'a, S: EntityStore + ?Sized> UpsertWriter<'a, S> {
    pub fn new(store: &'a S, config: WriterConfig) -> Self {
        Self { store, config }
    }

    pub async fn write(
        &self,
        entities: Vec<NormalizedEntity>,
        deadline: Option<Instant>,
    ) -> WriteReport {
        let entities = dedup_last_wins(entities, |e| e.business_id.clone());
        let batch_size = self.config.batch_size.max(1);
        let mut rows = entities.into_iter().peekable();
        let mut batches: Vec<Vec<NormalizedEntity>> = Vec::new();
        while rows.peek().is_some() {
            batches.push(rows.by_ref().take(batch_size).collect());
        }

        let mut report = WriteReport::default();
        let mut width = self.config.initial_wave_width.max(1);
        let mut contention = 0usize;
        let mut previous_wave_errors = 0usize;
        let mut pending = batches.into_iter().enumerate().peekable();

        while pending.peek().is_some() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.deadline_hit = true;
                report.batches_skipped = pending.len();
                warn!(skipped = report.batches_skipped, "run deadline reached; not starting further write waves");
                break;
            }
            if previous_wave_errors > 0 {
                let pause = self
                    .config
                    .pacing_per_error
                    .saturating_mul(previous_wave_errors as u32)
                    .min(self.config.max_pacing);
                tokio::time::sleep(pause).await;
            }

            let wave: Vec<(usize, Vec<NormalizedEntity>)> = pending.by_ref().take(width).collect();
            let wave_index = report.wave_widths.len();
            report.wave_widths.push(width);

            let runs = wave.into_iter().map(|(index, batch)| {
                let span = info_span!("upsert_batch", wave = wave_index, batch = index, rows = batch.len());
                async move {
                    let outcome = retry_with_backoff(
                        &self.config.retry,
                        StoreError::retry_disposition,
                        |_attempt| self.store.upsert_entities(&batch),
                    )
                    .await;
                    (index, batch, outcome)
                }
                .instrument(span)
            });

            let mut wave_errors = 0usize;
            for (index, batch, outcome) in join_all(runs).await {
                wave_errors += outcome.transient_errors;
                match outcome.result {
                    Ok(_) => {
                        report.written_count += batch.len();
                        report.written.extend(batch);
                    }
                    Err(err) => {
                        warn!(batch = index, attempts = outcome.attempts, %err, "upsert batch failed");
                        report.failed_batches.push(FailedBatch {
                            index,
                            business_ids: batch.into_iter().map(|e| e.business_id).collect(),
                            attempts: outcome.attempts,
                            error: err.to_string(),
                        });
                    }
                }
            }

            report.transient_errors += wave_errors;
            contention += wave_errors;
            if contention > self.config.contention_threshold {
                let narrowed = (width / 2).max(1);
                if narrowed < width {
                    warn!(from = width, to = narrowed, transient = contention, "write contention; narrowing wave width");
                }
                width = narrowed;
                contention = 0;
            }
            previous_wave_errors = wave_errors;
        }

        report.final_wave_width = width;
        info!(
            written = report.written_count,
            failed_batches = report.failed_batches.len(),
            waves = report.wave_widths.len(),
            transient = report.transient_errors,
            "entity writes complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use deltasync_store::MemoryStore;

    fn entities(count: usize) -> Vec<NormalizedEntity> {
        let ts = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).single().unwrap();
        (0..count)
            .map(|i| NormalizedEntity {
                business_id: format!("e{i:03}"),
                title: format!("Entity {i}"),
                status: "open".into(),
                owner: None,
                amount_cents: Some(i as i64),
                attributes: Default::default(),
                source_created_at: ts,
                source_modified_at: ts,
                content_hash: format!("h{i}"),
            })
            .collect()
    }

    fn config(batch_size: usize, width: usize, threshold: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            initial_wave_width: width,
            retry: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_jitter: Duration::from_millis(50),
            },
            contention_threshold: threshold,
            ..WriterConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_every_batch_in_waves() {
        let store = MemoryStore::new();
        store.set_upsert_delay(Some(Duration::from_millis(20)));
        let report = UpsertWriter::new(&store, config(10, 3, 3))
            .write(entities(95), None)
            .await;

        assert_eq!(report.written_count, 95);
        assert_eq!(report.wave_widths, vec![3, 3, 3, 3]);
        assert_eq!(store.entity_count(), 95);
        assert_eq!(store.entity_upsert_calls(), 10);
        assert_eq!(store.max_in_flight(), 3);
        assert_eq!(report.final_wave_width, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn contention_above_threshold_halves_the_next_wave() {
        let store = MemoryStore::new();
        // All five land in the first wave of four batches.
        store.inject_transient_upsert_failures(5);
        let report = UpsertWriter::new(&store, config(10, 4, 3))
            .write(entities(100), None)
            .await;

        assert_eq!(report.written_count, 100);
        assert!(report.failed_batches.is_empty());
        assert_eq!(report.transient_errors, 5);
        assert_eq!(report.wave_widths[..2], [4, 2]);
        assert!(report.wave_widths.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(report.final_wave_width, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn width_never_drops_below_one() {
        let store = MemoryStore::new();
        store.inject_transient_upsert_failures(40);
        let report = UpsertWriter::new(&store, config(5, 2, 0))
            .write(entities(30), None)
            .await;

        assert!(report.wave_widths.iter().all(|w| *w >= 1));
        assert_eq!(report.final_wave_width, 1);
        assert!(report.wave_widths.windows(2).all(|w| w[1] <= w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_isolated_to_its_batch() {
        let store = MemoryStore::new();
        store.poison_entity("e015");
        let report = UpsertWriter::new(&store, config(10, 2, 3))
            .write(entities(30), None)
            .await;

        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].index, 1);
        assert_eq!(report.failed_batches[0].attempts, 1);
        assert_eq!(report.written_count, 20);
        assert!(store.entity("e009").is_some());
        assert!(store.entity("e015").is_none());
        assert!(store.entity("e020").is_some());
        assert!(report.written.iter().all(|e| e.business_id != "e012"));
        assert_eq!(report.written.len(), report.written_count);
    }

    #[tokio::test(start_paused = true)]
    async fn rewriting_the_same_rows_is_idempotent() {
        let store = MemoryStore::new();
        let writer = UpsertWriter::new(&store, config(7, 2, 3));
        writer.write(entities(20), None).await;
        let first: Vec<_> = store.entities().into_iter().map(|s| s.entity).collect();
        writer.write(entities(20), None).await;
        let second: Vec<_> = store.entities().into_iter().map(|s| s.entity).collect();

        assert_eq!(first, second);
        assert_eq!(store.entity_count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_starts_no_waves() {
        let store = MemoryStore::new();
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        let report = UpsertWriter::new(&store, config(10, 2, 3))
            .write(entities(25), Some(deadline))
            .await;

        assert!(report.deadline_hit);
        assert_eq!(report.batches_skipped, 3);
        assert_eq!(report.written_count, 0);
        assert_eq!(store.entity_upsert_calls(), 0);
    }
}
