//! Core domain model for the deltasync engine.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod planner;
pub mod retry;

pub use planner::{plan_pages, PagePlan, PageRequest};
pub use retry::{retry_with_backoff, BackoffPolicy, RetryDisposition, RetryOutcome};

pub const CRATE_NAME: &str = "deltasync-core";

/// Validated record from the source listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub last_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub status: String,
    pub owner: Option<String>,
    pub amount_cents: Option<i64>,
}

/// Sparse key/value attribute attached to a source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedAttribute {
    pub owner_id: String,
    pub attribute_key: String,
    pub attribute_value: String,
}

/// Persisted change-tracking state, one row per record id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingFingerprint {
    pub record_id: String,
    pub last_seen_modified_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub attribute_count: u32,
}

/// Persistence-ready projection of a record joined with its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub business_id: String,
    pub title: String,
    pub status: String,
    pub owner: Option<String>,
    pub amount_cents: Option<i64>,
    pub attributes: BTreeMap<String, String>,
    pub source_created_at: DateTime<Utc>,
    pub source_modified_at: DateTime<Utc>,
    pub content_hash: String,
}

impl NormalizedEntity {
    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Hash over the business content only; source timestamps are excluded so
    /// a touch without a content change keeps the same hash.
    pub fn compute_content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "business_id": self.business_id,
            "title": self.title,
            "status": self.status,
            "owner": self.owner,
            "amount_cents": self.amount_cents,
            "attributes": self.attributes,
        });
        Self::sha256_hex(canonical.to_string().as_bytes())
    }
}

/// Collapse rows sharing a key; the last occurrence wins but keeps the slot of
/// the first, so a single upsert statement never touches one key twice.
pub fn dedup_last_wins<T, K, F>(rows: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::new();
    for row in rows {
        match slots.entry(key(&row)) {
            Entry::Occupied(slot) => out[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(row);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    New,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Orchestrator states, in the order a full run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Planning,
    Listing,
    Classifying,
    EarlyExit,
    Projecting,
    Writing,
    Finalizing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl From<RunStatus> for SyncPhase {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => Self::Completed,
            RunStatus::CompletedWithErrors => Self::CompletedWithErrors,
            RunStatus::Running | RunStatus::Failed => Self::Failed,
        }
    }
}

/// Options accepted by the single "run sync" trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub clear_first: bool,
    pub dry_run: bool,
    pub all_records: bool,
    pub max_records: Option<u64>,
    pub force_full_run: bool,
}

impl SyncOptions {
    /// Processing cap for this run; `None` means uncapped.
    pub fn hard_cap(&self, default_max_records: u64) -> Option<u64> {
        if self.all_records {
            None
        } else {
            Some(self.max_records.unwrap_or(default_max_records))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageErrors {
    pub list_pages_failed: usize,
    /// List pages never requested because the run deadline passed.
    pub list_pages_skipped: usize,
    pub invalid_records: usize,
    pub attribute_requests_failed: usize,
    /// Single-owner attribute responses that filled the page limit; the record is dropped.
    pub attribute_pages_truncated: usize,
    /// Malformed attribute rows; the records they were fetched for are dropped.
    pub attributes_rejected: usize,
    pub projection_dropped: usize,
    pub batches_failed: usize,
    pub transient_write_errors: usize,
    pub fingerprint_batches_failed: usize,
    /// Run ledger writes (start or finish) that did not land.
    pub ledger_writes_failed: usize,
}

impl StageErrors {
    /// Errors that leave part of the run's work undone. Transient write errors
    /// that were retried successfully do not count.
    pub fn has_unrecovered(&self) -> bool {
        self.list_pages_failed > 0
            || self.list_pages_skipped > 0
            || self.invalid_records > 0
            || self.attribute_requests_failed > 0
            || self.attribute_pages_truncated > 0
            || self.attributes_rejected > 0
            || self.projection_dropped > 0
            || self.batches_failed > 0
            || self.fingerprint_batches_failed > 0
            || self.ledger_writes_failed > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub fetched_per_sec: f64,
    pub written_per_sec: f64,
}

/// Structured result of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub options: SyncOptions,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_available: u64,
    pub total_fetched: usize,
    pub new_records: usize,
    pub modified_records: usize,
    pub unchanged_records: usize,
    pub to_process: usize,
    pub total_written: usize,
    pub fingerprints_persisted: usize,
    pub tracker_failed_open: bool,
    pub deadline_exceeded: bool,
    pub errors: StageErrors,
    pub final_wave_width: usize,
    pub phases: Vec<SyncPhase>,
    pub elapsed_ms: u64,
    pub throughput: Throughput,
    pub error_message: Option<String>,
}

impl SyncSummary {
    pub fn new(run_id: Uuid, options: SyncOptions, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            options,
            started_at,
            completed_at: started_at,
            total_available: 0,
            total_fetched: 0,
            new_records: 0,
            modified_records: 0,
            unchanged_records: 0,
            to_process: 0,
            total_written: 0,
            fingerprints_persisted: 0,
            tracker_failed_open: false,
            deadline_exceeded: false,
            errors: StageErrors::default(),
            final_wave_width: 0,
            phases: vec![SyncPhase::Idle],
            elapsed_ms: 0,
            throughput: Throughput::default(),
            error_message: None,
        }
    }

    pub fn counts(&self) -> RunCounts {
        RunCounts {
            total_available: self.total_available,
            total_fetched: self.total_fetched,
            to_process: self.to_process,
            total_written: self.total_written,
            fingerprints_persisted: self.fingerprints_persisted,
            errors: self.errors.clone(),
        }
    }
}

/// Count snapshot stored on the run ledger row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total_available: u64,
    pub total_fetched: usize,
    pub to_process: usize,
    pub total_written: usize,
    pub fingerprints_persisted: usize,
    pub errors: StageErrors,
}

/// Run ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub options: SyncOptions,
    pub counts: RunCounts,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn started(id: Uuid, started_at: DateTime<Utc>, options: SyncOptions) -> Self {
        Self {
            id,
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            options,
            counts: RunCounts::default(),
            error_message: None,
        }
    }

    pub fn finished_from(summary: &SyncSummary) -> Self {
        Self {
            id: summary.run_id,
            started_at: summary.started_at,
            completed_at: Some(summary.completed_at),
            status: summary.status,
            options: summary.options.clone(),
            counts: summary.counts(),
            error_message: summary.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entity() -> NormalizedEntity {
        let ts = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        NormalizedEntity {
            business_id: "deal-1".into(),
            title: "Renewal".into(),
            status: "open".into(),
            owner: Some("ana".into()),
            amount_cents: Some(125_00),
            attributes: BTreeMap::from([("region".to_string(), "emea".to_string())]),
            source_created_at: ts,
            source_modified_at: ts,
            content_hash: String::new(),
        }
    }

    #[test]
    fn content_hash_ignores_source_timestamps() {
        let a = entity();
        let mut b = entity();
        b.source_modified_at = b.source_modified_at + chrono::Duration::hours(3);
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());

        b.attributes.insert("tier".into(), "gold".into());
        assert_ne!(a.compute_content_hash(), b.compute_content_hash());
    }

    #[test]
    fn dedup_keeps_last_value_per_key() {
        let rows = vec![("a", 1), ("b", 2), ("a", 3), ("c", 4), ("b", 5)];
        let deduped = dedup_last_wins(rows, |(k, _)| *k);
        assert_eq!(deduped, vec![("a", 3), ("b", 5), ("c", 4)]);
    }

    #[test]
    fn hard_cap_honors_all_records_flag() {
        let capped = SyncOptions {
            max_records: Some(40),
            ..Default::default()
        };
        assert_eq!(capped.hard_cap(1000), Some(40));
        assert_eq!(SyncOptions::default().hard_cap(1000), Some(1000));

        let uncapped = SyncOptions {
            all_records: true,
            max_records: Some(40),
            ..Default::default()
        };
        assert_eq!(uncapped.hard_cap(1000), None);
    }

    #[test]
    fn run_status_round_trips_through_text() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::CompletedWithErrors,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }

    #[test]
    fn rejected_attributes_and_ledger_failures_are_unrecovered() {
        assert!(!StageErrors {
            transient_write_errors: 4,
            ..Default::default()
        }
        .has_unrecovered());
        assert!(StageErrors {
            attributes_rejected: 1,
            ..Default::default()
        }
        .has_unrecovered());
        assert!(StageErrors {
            ledger_writes_failed: 1,
            ..Default::default()
        }
        .has_unrecovered());
    }

    #[test]
    fn stage_errors_missing_newer_counters_decode_as_zero() {
        let errors: StageErrors =
            serde_json::from_str(r#"{"list_pages_failed": 2, "batches_failed": 1}"#).unwrap();
        assert_eq!(errors.list_pages_failed, 2);
        assert_eq!(errors.attributes_rejected, 0);
        assert_eq!(errors.ledger_writes_failed, 0);
    }
}
