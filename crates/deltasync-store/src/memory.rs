//! In-process store used by tests and dry local runs. Mirrors the Postgres
//! upsert semantics and exposes fault injection hooks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deltasync_core::{dedup_last_wins, NormalizedEntity, SyncRun, TrackingFingerprint};

use crate::{EntityStore, FingerprintStore, RunLedger, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntity {
    pub entity: NormalizedEntity,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    entities: BTreeMap<String, StoredEntity>,
    fingerprints: HashMap<String, TrackingFingerprint>,
    runs: Vec<SyncRun>,
    fail_fingerprint_lookup: bool,
    fail_ledger_writes: bool,
    fail_fingerprint_writes: bool,
    transient_upsert_failures: usize,
    transient_fingerprint_failures: usize,
    poisoned: HashSet<String>,
    upsert_delay: Option<Duration>,
    entity_upsert_calls: usize,
    fingerprint_upsert_calls: usize,
    fingerprint_lookup_calls: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed_fingerprint(&self, fingerprint: TrackingFingerprint) {
        self.lock()
            .fingerprints
            .insert(fingerprint.record_id.clone(), fingerprint);
    }

    /// Every fingerprint lookup fails until reset.
    pub fn fail_fingerprint_lookup(&self, fail: bool) {
        self.lock().fail_fingerprint_lookup = fail;
    }

    pub fn fail_fingerprint_writes(&self, fail: bool) {
        self.lock().fail_fingerprint_writes = fail;
    }

    /// The next `count` entity upserts fail with a contention error.
    pub fn inject_transient_upsert_failures(&self, count: usize) {
        self.lock().transient_upsert_failures = count;
    }

    /// Reject `start_run` and `finish_run`, as an unreachable ledger table would.
    pub fn fail_ledger_writes(&self, fail: bool) {
        self.lock().fail_ledger_writes = fail;
    }

    /// The next `count` fingerprint upserts fail with a deadlock error.
    pub fn inject_transient_fingerprint_failures(&self, count: usize) {
        self.lock().transient_fingerprint_failures = count;
    }

    /// Any batch containing this id fails with a constraint violation.
    pub fn poison_entity(&self, business_id: impl Into<String>) {
        self.lock().poisoned.insert(business_id.into());
    }

    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        self.lock().upsert_delay = delay;
    }

    pub fn entity(&self, business_id: &str) -> Option<StoredEntity> {
        self.lock().entities.get(business_id).cloned()
    }

    pub fn entities(&self) -> Vec<StoredEntity> {
        self.lock().entities.values().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn fingerprint(&self, record_id: &str) -> Option<TrackingFingerprint> {
        self.lock().fingerprints.get(record_id).cloned()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.lock().fingerprints.len()
    }

    pub fn runs(&self) -> Vec<SyncRun> {
        self.lock().runs.clone()
    }

    pub fn entity_upsert_calls(&self) -> usize {
        self.lock().entity_upsert_calls
    }

    pub fn fingerprint_upsert_calls(&self) -> usize {
        self.lock().fingerprint_upsert_calls
    }

    pub fn fingerprint_lookup_calls(&self) -> usize {
        self.lock().fingerprint_lookup_calls
    }

    /// Highest number of entity upserts observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    async fn load_fingerprints(
        &self,
        record_ids: &[String],
    ) -> StoreResult<HashMap<String, TrackingFingerprint>> {
        let mut inner = self.lock();
        inner.fingerprint_lookup_calls += 1;
        if inner.fail_fingerprint_lookup {
            return Err(StoreError::Transient("fingerprint table unavailable".into()));
        }
        Ok(record_ids
            .iter()
            .filter_map(|id| inner.fingerprints.get(id).map(|f| (id.clone(), f.clone())))
            .collect())
    }

    async fn upsert_fingerprints(&self, rows: &[TrackingFingerprint]) -> StoreResult<u64> {
        let mut inner = self.lock();
        inner.fingerprint_upsert_calls += 1;
        if inner.fail_fingerprint_writes {
            return Err(StoreError::Constraint("fingerprint writes disabled".into()));
        }
        if inner.transient_fingerprint_failures > 0 {
            inner.transient_fingerprint_failures -= 1;
            return Err(StoreError::Transient("40P01: deadlock detected".into()));
        }
        let rows = dedup_last_wins(rows.iter().cloned(), |r| r.record_id.clone());
        let written = rows.len() as u64;
        for row in rows {
            match inner.fingerprints.get_mut(&row.record_id) {
                Some(existing) => {
                    existing.last_seen_modified_at =
                        existing.last_seen_modified_at.max(row.last_seen_modified_at);
                    existing.last_checked_at = row.last_checked_at;
                    existing.content_hash = row.content_hash;
                    existing.attribute_count = row.attribute_count;
                }
                None => {
                    inner.fingerprints.insert(row.record_id.clone(), row);
                }
            }
        }
        Ok(written)
    }

    async fn clear_fingerprints(&self) -> StoreResult<u64> {
        let mut inner = self.lock();
        let removed = inner.fingerprints.len() as u64;
        inner.fingerprints.clear();
        Ok(removed)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert_entities(&self, batch: &[NormalizedEntity]) -> StoreResult<u64> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = self.lock().upsert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        inner.entity_upsert_calls += 1;
        if inner.transient_upsert_failures > 0 {
            inner.transient_upsert_failures -= 1;
            return Err(StoreError::Transient("40001: could not serialize access".into()));
        }
        if let Some(bad) = batch.iter().find(|e| inner.poisoned.contains(&e.business_id)) {
            return Err(StoreError::Constraint(format!(
                "23514: check constraint rejected {}",
                bad.business_id
            )));
        }

        // One statement: either every row lands or none does.
        let rows = dedup_last_wins(batch.iter().cloned(), |e| e.business_id.clone());
        let written = rows.len() as u64;
        let now = Utc::now();
        for entity in rows {
            match inner.entities.get_mut(&entity.business_id) {
                Some(stored) => {
                    stored.entity = entity;
                    stored.version += 1;
                    stored.updated_at = now;
                }
                None => {
                    inner.entities.insert(
                        entity.business_id.clone(),
                        StoredEntity {
                            entity,
                            version: 1,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        Ok(written)
    }

    async fn delete_all_entities(&self) -> StoreResult<u64> {
        let mut inner = self.lock();
        let removed = inner.entities.len() as u64;
        inner.entities.clear();
        Ok(removed)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn start_run(&self, run: &SyncRun) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.fail_ledger_writes {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        inner.runs.push(run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.fail_ledger_writes {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        match inner.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(StoreError::Malformed(format!("run {} was never started", run.id))),
        }
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>> {
        let mut runs = self.lock().runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}
