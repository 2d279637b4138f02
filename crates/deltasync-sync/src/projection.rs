//! Field projection: attributes are fetched only for records that need
//! reprocessing, then joined into normalized entities.

use std::collections::{BTreeMap, HashMap, HashSet};

use deltasync_core::{AttachedAttribute, NormalizedEntity, SourceRecord};
use deltasync_source::{BatchFetcher, SourceApi, SourceError};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::tracker::ClassifiedRecord;

#[derive(Debug, Default)]
pub struct ProjectionOutcome {
    pub entities: Vec<NormalizedEntity>,
    pub requests_issued: usize,
    pub requests_failed: usize,
    /// Records left out because their attributes could not be fetched completely.
    pub dropped_ids: Vec<String>,
    /// Malformed attribute rows. Every record in the affected request is dropped.
    pub attributes_rejected: usize,
    /// Full pages re-requested as two smaller owner-id chunks.
    pub pages_split: usize,
    /// Full pages for a single owner, which cannot be split further.
    pub pages_truncated: usize,
    pub fatal: Option<SourceError>,
    pub deadline_hit: bool,
}

pub struct FieldProjection<'a> {
    source: &'a dyn SourceApi,
    fetcher: &'a BatchFetcher,
    ids_per_request: usize,
}

impl<'a> FieldProjection<'a> {
    pub fn new(source: &'a dyn SourceApi, fetcher: &'a BatchFetcher, ids_per_request: usize) -> Self {
        Self {
            source,
            fetcher,
            ids_per_request: ids_per_request.max(1),
        }
    }

    pub async fn project(
        &self,
        to_process: &[ClassifiedRecord],
        deadline: Option<Instant>,
    ) -> ProjectionOutcome {
        let mut out = ProjectionOutcome::default();
        if to_process.is_empty() {
            return out;
        }

        let ids: Vec<String> = to_process.iter().map(|c| c.record.id.clone()).collect();
        let mut pending: Vec<Vec<String>> = ids
            .chunks(self.ids_per_request)
            .map(<[String]>::to_vec)
            .collect();
        let limit = self.source.attribute_limit().max(1);
        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut unavailable: HashSet<String> = HashSet::new();
        let mut by_owner: HashMap<String, Vec<AttachedAttribute>> = HashMap::new();

        let source = self.source;
        while !pending.is_empty() {
            out.requests_issued += pending.len();
            let fetched = self
                .fetcher
                .fetch_all(std::mem::take(&mut pending), deadline, |owner_ids: Vec<String>| async move {
                    source.fetch_attributes(&owner_ids).await
                })
                .await;

            for failure in &fetched.failures {
                unavailable.extend(failure.request.iter().cloned());
            }
            for skipped in &fetched.skipped {
                unavailable.extend(skipped.iter().cloned());
            }
            out.requests_failed += fetched.failures.len();
            out.deadline_hit |= fetched.deadline_hit;
            if out.fatal.is_none() {
                out.fatal = fetched
                    .failures
                    .into_iter()
                    .map(|f| f.error)
                    .find(SourceError::is_fatal);
            }

            for (owner_ids, page) in fetched.successes {
                if page.attributes.len() + page.rejected >= limit {
                    if owner_ids.len() > 1 {
                        let (left, right) = owner_ids.split_at(owner_ids.len() / 2);
                        pending.push(left.to_vec());
                        pending.push(right.to_vec());
                        out.pages_split += 1;
                    } else {
                        warn!(owner = ?owner_ids, limit, "attribute page full for a single owner; record left out");
                        out.pages_truncated += 1;
                        unavailable.extend(owner_ids);
                    }
                    continue;
                }
                if page.rejected > 0 {
                    warn!(rejected = page.rejected, owners = owner_ids.len(), "malformed attribute rows; records left out");
                    out.attributes_rejected += page.rejected;
                    unavailable.extend(owner_ids);
                    continue;
                }
                for attribute in page.attributes {
                    if requested.contains(attribute.owner_id.as_str()) {
                        by_owner
                            .entry(attribute.owner_id.clone())
                            .or_default()
                            .push(attribute);
                    }
                }
            }

            if out.fatal.is_some() {
                for chunk in pending.drain(..) {
                    unavailable.extend(chunk);
                }
            }
        }

        for classified in to_process {
            let record = &classified.record;
            if unavailable.contains(&record.id) {
                out.dropped_ids.push(record.id.clone());
                continue;
            }
            let attributes = by_owner.get(&record.id).map(Vec::as_slice).unwrap_or(&[]);
            out.entities.push(normalize(record, attributes));
        }

        if !out.dropped_ids.is_empty() {
            warn!(
                dropped = out.dropped_ids.len(),
                failed_requests = out.requests_failed,
                rejected_rows = out.attributes_rejected,
                truncated_pages = out.pages_truncated,
                "records without complete attributes left out of this run"
            );
        }
        info!(
            entities = out.entities.len(),
            requests = out.requests_issued,
            split = out.pages_split,
            "projection complete"
        );
        out
    }
}

/// Join a record with its attributes. A repeated attribute key keeps the last
/// value seen.
pub fn normalize(record: &SourceRecord, attributes: &[AttachedAttribute]) -> NormalizedEntity {
    let attributes: BTreeMap<String, String> = attributes
        .iter()
        .map(|a| (a.attribute_key.trim().to_string(), a.attribute_value.clone()))
        .collect();
    let mut entity = NormalizedEntity {
        business_id: record.id.clone(),
        title: record.title.trim().to_string(),
        status: record.status.trim().to_ascii_lowercase(),
        owner: record.owner.clone(),
        amount_cents: record.amount_cents,
        attributes,
        source_created_at: record.created_at,
        source_modified_at: record.last_modified_at,
        content_hash: String::new(),
    };
    entity.content_hash = entity.compute_content_hash();
    entity
}
