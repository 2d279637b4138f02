//! Change tracker: decides which fetched records need reprocessing.

use chrono::{DateTime, Utc};
use deltasync_core::{
    dedup_last_wins, retry_with_backoff, BackoffPolicy, ChangeReason, NormalizedEntity, SourceRecord,
    TrackingFingerprint,
};
use deltasync_store::{FingerprintStore, StoreError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRecord {
    pub record: SourceRecord,
    pub reason: ChangeReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub to_process: Vec<ClassifiedRecord>,
    pub skipped: Vec<SourceRecord>,
    /// Lookup failed and every record was treated as new.
    pub failed_open: bool,
}

impl Classification {
    pub fn count(&self, reason: ChangeReason) -> usize {
        self.to_process.iter().filter(|c| c.reason == reason).count()
    }

    /// Every record marked `Modified`; used when classification is bypassed.
    pub fn force_all(records: Vec<SourceRecord>) -> Self {
        Self {
            to_process: records
                .into_iter()
                .map(|record| ClassifiedRecord {
                    record,
                    reason: ChangeReason::Modified,
                })
                .collect(),
            skipped: Vec::new(),
            failed_open: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub persisted: usize,
    pub failed_batches: usize,
    /// Contention errors absorbed by retries.
    pub transient_errors: usize,
}

pub struct ChangeTracker<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: FingerprintStore + ?Sized> ChangeTracker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn classify(&self, records: Vec<SourceRecord>) -> Classification {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let known = match self.store.load_fingerprints(&ids).await {
            Ok(known) => known,
            Err(err) => {
                warn!(%err, records = records.len(), "fingerprint lookup failed; treating every record as new");
                return Classification {
                    to_process: records
                        .into_iter()
                        .map(|record| ClassifiedRecord {
                            record,
                            reason: ChangeReason::New,
                        })
                        .collect(),
                    skipped: Vec::new(),
                    failed_open: true,
                };
            }
        };

        let mut out = Classification::default();
        for record in records {
            match known.get(&record.id) {
                None => out.to_process.push(ClassifiedRecord {
                    record,
                    reason: ChangeReason::New,
                }),
                Some(fp) if record.last_modified_at > fp.last_seen_modified_at => {
                    out.to_process.push(ClassifiedRecord {
                        record,
                        reason: ChangeReason::Modified,
                    })
                }
                Some(_) => out.skipped.push(record),
            }
        }
        info!(
            new = out.count(ChangeReason::New),
            modified = out.count(ChangeReason::Modified),
            unchanged = out.skipped.len(),
            "records classified"
        );
        out
    }

    /// Upsert fingerprints in chunks of `batch_size`, retrying contention per
    /// chunk. Callers pass only entities that were durably written in this run.
    pub async fn persist(
        &self,
        written: &[NormalizedEntity],
        checked_at: DateTime<Utc>,
        batch_size: usize,
        retry: &BackoffPolicy,
    ) -> PersistReport {
        let rows = dedup_last_wins(
            written.iter().map(|entity| fingerprint_for(entity, checked_at)),
            |row| row.record_id.clone(),
        );

        let mut report = PersistReport::default();
        for chunk in rows.chunks(batch_size.max(1)) {
            let outcome = retry_with_backoff(retry, StoreError::retry_disposition, |_attempt| {
                self.store.upsert_fingerprints(chunk)
            })
            .await;
            report.transient_errors += outcome.transient_errors;
            match outcome.result {
                Ok(_) => report.persisted += chunk.len(),
                Err(err) => {
                    warn!(%err, rows = chunk.len(), attempts = outcome.attempts, "fingerprint batch failed; records will be reprocessed next run");
                    report.failed_batches += 1;
                }
            }
        }
        report
    }
}

pub fn fingerprint_for(entity: &NormalizedEntity, checked_at: DateTime<Utc>) -> TrackingFingerprint {
    TrackingFingerprint {
        record_id: entity.business_id.clone(),
        last_seen_modified_at: entity.source_modified_at,
        last_checked_at: checked_at,
        content_hash: Some(entity.content_hash.clone()),
        attribute_count: u32::try_from(entity.attributes.len()).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use deltasync_store::MemoryStore;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn record(id: &str, modified_hour: u32) -> SourceRecord {
        SourceRecord {
            id: id.into(),
            last_modified_at: at(modified_hour),
            created_at: at(0),
            title: format!("Record {id}"),
            status: "open".into(),
            owner: None,
            amount_cents: None,
        }
    }

    fn seen(id: &str, hour: u32) -> TrackingFingerprint {
        TrackingFingerprint {
            record_id: id.into(),
            last_seen_modified_at: at(hour),
            last_checked_at: at(hour),
            content_hash: None,
            attribute_count: 0,
        }
    }

    #[tokio::test]
    async fn classifies_new_modified_and_unchanged() {
        let store = MemoryStore::new();
        store.seed_fingerprint(seen("same", 5));
        store.seed_fingerprint(seen("newer", 5));
        store.seed_fingerprint(seen("older", 5));

        let out = ChangeTracker::new(&store)
            .classify(vec![
                record("fresh", 1),
                record("same", 5),
                record("newer", 6),
                record("older", 4),
            ])
            .await;

        let reasons: Vec<_> = out
            .to_process
            .iter()
            .map(|c| (c.record.id.as_str(), c.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![("fresh", ChangeReason::New), ("newer", ChangeReason::Modified)]
        );
        let skipped: Vec<_> = out.skipped.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(skipped, vec!["same", "older"]);
        assert!(!out.failed_open);
    }

    #[tokio::test]
    async fn lookup_failure_fails_open() {
        let store = MemoryStore::new();
        store.seed_fingerprint(seen("a", 9));
        store.fail_fingerprint_lookup(true);

        let out = ChangeTracker::new(&store)
            .classify(vec![record("a", 1), record("b", 1)])
            .await;
        assert!(out.failed_open);
        assert_eq!(out.count(ChangeReason::New), 2);
        assert!(out.skipped.is_empty());
    }

    fn entity(id: &str, hour: u32) -> NormalizedEntity {
        NormalizedEntity {
            business_id: id.into(),
            title: "t".into(),
            status: "open".into(),
            owner: None,
            amount_cents: None,
            attributes: Default::default(),
            source_created_at: at(0),
            source_modified_at: at(hour),
            content_hash: "h".into(),
        }
    }

    fn retry() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: std::time::Duration::from_millis(20),
            max_delay: std::time::Duration::from_millis(100),
            max_jitter: std::time::Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persist_dedups_and_reports_failed_chunks() {
        let store = MemoryStore::new();
        let tracker = ChangeTracker::new(&store);
        let report = tracker
            .persist(&[entity("a", 1), entity("b", 1), entity("a", 3)], at(12), 10, &retry())
            .await;
        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(store.fingerprint("a").unwrap().last_seen_modified_at, at(3));

        store.fail_fingerprint_writes(true);
        let calls_before = store.fingerprint_upsert_calls();
        let report = tracker.persist(&[entity("c", 1)], at(12), 10, &retry()).await;
        assert_eq!(report.persisted, 0);
        assert_eq!(report.failed_batches, 1);
        // Constraint errors are not retried.
        assert_eq!(store.fingerprint_upsert_calls() - calls_before, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_retries_contended_fingerprint_chunks() {
        let store = MemoryStore::new();
        store.inject_transient_fingerprint_failures(2);
        let tracker = ChangeTracker::new(&store);

        let written: Vec<_> = (0..5).map(|i| entity(&format!("r{i}"), 2)).collect();
        let report = tracker.persist(&written, at(12), 2, &retry()).await;

        assert_eq!(report.persisted, 5);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(report.transient_errors, 2);
        assert_eq!(store.fingerprint_count(), 5);
        // Three chunks plus two retried attempts.
        assert_eq!(store.fingerprint_upsert_calls(), 5);
    }
}
