//! In-process [`SourceApi`] used by tests and local dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deltasync_core::{AttachedAttribute, PageRequest, SourceRecord};
use reqwest::StatusCode;

use crate::wire::{AttributePage, ListPage};
use crate::{SourceApi, SourceError};

#[derive(Debug, Clone, Copy)]
struct PageFault {
    remaining: usize,
    status: StatusCode,
}

#[derive(Debug, Default)]
struct State {
    records: Vec<SourceRecord>,
    attributes: Vec<AttachedAttribute>,
    page_faults: HashMap<u64, PageFault>,
    attribute_fault_owners: Vec<String>,
    malformed_attribute_rows: HashMap<String, usize>,
    attribute_limit: Option<usize>,
    reject_auth: bool,
    list_calls: Vec<PageRequest>,
    attribute_calls: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<State>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>, attributes: Vec<AttachedAttribute>) -> Self {
        Self {
            state: Mutex::new(State {
                records,
                attributes,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move a record's `lastModifiedAt` forward, as an upstream edit would.
    pub fn touch(&self, id: &str, modified_at: DateTime<Utc>) -> bool {
        let mut state = self.state();
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.last_modified_at = modified_at;
                true
            }
            None => false,
        }
    }

    /// Fail the page starting at `offset` with `status` for the next `times` calls.
    pub fn fail_page(&self, offset: u64, times: usize, status: StatusCode) {
        self.state().page_faults.insert(
            offset,
            PageFault {
                remaining: times,
                status,
            },
        );
    }

    /// Permanently fail any attribute request that includes `owner_id`.
    pub fn fail_attributes_for(&self, owner_id: &str) {
        self.state().attribute_fault_owners.push(owner_id.to_string());
    }

    /// Report `rows` malformed attribute rows in any response covering `owner_id`.
    pub fn malformed_attributes_for(&self, owner_id: &str, rows: usize) {
        self.state()
            .malformed_attribute_rows
            .insert(owner_id.to_string(), rows);
    }

    /// Cap every attribute response at `limit` rows, as a server page limit would.
    pub fn set_attribute_limit(&self, limit: usize) {
        self.state().attribute_limit = Some(limit.max(1));
    }

    pub fn reject_auth(&self) {
        self.state().reject_auth = true;
    }

    pub fn list_calls(&self) -> Vec<PageRequest> {
        self.state().list_calls.clone()
    }

    pub fn attribute_calls(&self) -> Vec<Vec<String>> {
        self.state().attribute_calls.clone()
    }

    pub fn requested_owner_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().attribute_calls.concat();
        ids.sort();
        ids
    }

    pub fn reset_calls(&self) {
        let mut state = self.state();
        state.list_calls.clear();
        state.attribute_calls.clear();
    }
}

#[async_trait]
impl SourceApi for MemorySource {
    async fn list_page(&self, page: PageRequest) -> Result<ListPage, SourceError> {
        let mut state = self.state();
        state.list_calls.push(page);
        if state.reject_auth {
            return Err(SourceError::http(StatusCode::UNAUTHORIZED, "memory://records", ""));
        }
        if let Some(fault) = state.page_faults.get_mut(&page.offset) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(SourceError::http(fault.status, "memory://records", "injected"));
            }
        }

        let total = state.records.len() as u64;
        let start = (page.offset.min(total)) as usize;
        let end = (page.offset.saturating_add(page.limit).min(total)) as usize;
        Ok(ListPage {
            total,
            records: state.records[start..end].to_vec(),
            rejected: Vec::new(),
        })
    }

    async fn fetch_attributes(&self, owner_ids: &[String]) -> Result<AttributePage, SourceError> {
        let mut state = self.state();
        state.attribute_calls.push(owner_ids.to_vec());
        if state.reject_auth {
            return Err(SourceError::http(StatusCode::FORBIDDEN, "memory://attributes", ""));
        }
        if owner_ids
            .iter()
            .any(|id| state.attribute_fault_owners.contains(id))
        {
            return Err(SourceError::http(
                StatusCode::BAD_REQUEST,
                "memory://attributes",
                "injected",
            ));
        }

        let limit = state.attribute_limit.unwrap_or(usize::MAX);
        let rejected: usize = owner_ids
            .iter()
            .filter_map(|id| state.malformed_attribute_rows.get(id))
            .sum::<usize>()
            .min(limit);
        let attributes = state
            .attributes
            .iter()
            .filter(|a| owner_ids.contains(&a.owner_id))
            .take(limit - rejected)
            .cloned()
            .collect();
        Ok(AttributePage {
            attributes,
            rejected,
        })
    }

    fn attribute_limit(&self) -> usize {
        self.state().attribute_limit.unwrap_or(usize::MAX)
    }
}
