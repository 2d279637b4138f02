//! Ingestion boundary: loosely-typed API payloads in, validated domain records out.

use chrono::{DateTime, Utc};
use deltasync_core::{AttachedAttribute, SourceRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::SourceError;

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    records: Vec<JsonValue>,
    meta: ListMeta,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
    total: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    id: String,
    last_modified_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    title: String,
    status: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    amount_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AttributeEnvelope {
    attributes: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttribute {
    owner_id: String,
    attribute_key: String,
    attribute_value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub id: Option<String>,
    pub reason: String,
}

/// One decoded page of the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListPage {
    pub total: u64,
    pub records: Vec<SourceRecord>,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributePage {
    pub attributes: Vec<AttachedAttribute>,
    pub rejected: usize,
}

pub fn decode_list_page(body: &[u8]) -> Result<ListPage, SourceError> {
    let envelope: ListEnvelope = serde_json::from_slice(body)
        .map_err(|e| SourceError::Decode(format!("list envelope: {e}")))?;

    let mut page = ListPage {
        total: envelope.meta.total,
        ..Default::default()
    };
    for raw in envelope.records {
        match validate_record(raw) {
            Ok(record) => page.records.push(record),
            Err(rejected) => {
                warn!(id = ?rejected.id, reason = %rejected.reason, "rejecting malformed source record");
                page.rejected.push(rejected);
            }
        }
    }
    Ok(page)
}

fn validate_record(raw: JsonValue) -> Result<SourceRecord, RejectedRecord> {
    let id_hint = raw
        .get("id")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);
    let wire: WireRecord = serde_json::from_value(raw).map_err(|e| RejectedRecord {
        id: id_hint.clone(),
        reason: e.to_string(),
    })?;

    let id = wire.id.trim().to_string();
    if id.is_empty() {
        return Err(RejectedRecord {
            id: None,
            reason: "empty id".to_string(),
        });
    }

    Ok(SourceRecord {
        id,
        last_modified_at: wire.last_modified_at,
        created_at: wire.created_at,
        title: wire.title,
        status: wire.status,
        owner: wire.owner.filter(|o| !o.trim().is_empty()),
        amount_cents: wire.amount_cents,
    })
}

pub fn decode_attributes(body: &[u8]) -> Result<AttributePage, SourceError> {
    let envelope: AttributeEnvelope = serde_json::from_slice(body)
        .map_err(|e| SourceError::Decode(format!("attribute envelope: {e}")))?;

    let mut page = AttributePage::default();
    for raw in envelope.attributes {
        let Ok(wire) = serde_json::from_value::<WireAttribute>(raw) else {
            page.rejected += 1;
            continue;
        };
        let value = match wire.attribute_value {
            JsonValue::String(s) => s,
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            _ => {
                page.rejected += 1;
                continue;
            }
        };
        if wire.owner_id.is_empty() || wire.attribute_key.is_empty() {
            page.rejected += 1;
            continue;
        }
        page.attributes.push(AttachedAttribute {
            owner_id: wire.owner_id,
            attribute_key: wire.attribute_key,
            attribute_value: value,
        });
    }
    if page.rejected > 0 {
        warn!(rejected = page.rejected, "dropped malformed attribute rows");
    }
    Ok(page)
}
