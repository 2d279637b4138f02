//! Postgres-backed store (sqlx).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deltasync_core::{
    dedup_last_wins, NormalizedEntity, RunCounts, RunStatus, SyncOptions, SyncRun,
    TrackingFingerprint,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::{EntityStore, FingerprintStore, RunLedger, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        // Do not log the url; it carries credentials.
        let options = PgConnectOptions::from_str(&config.database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("sync schema migrations applied");
        Ok(())
    }
}

fn fingerprint_from_row(row: &PgRow) -> StoreResult<TrackingFingerprint> {
    let attribute_count: i32 = row.try_get("attribute_count")?;
    Ok(TrackingFingerprint {
        record_id: row.try_get("record_id")?,
        last_seen_modified_at: row.try_get("last_seen_modified_at")?,
        last_checked_at: row.try_get("last_checked_at")?,
        content_hash: row.try_get("content_hash")?,
        attribute_count: u32::try_from(attribute_count).unwrap_or(0),
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<SyncRun> {
    let status: String = row.try_get("status")?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Malformed(format!("unknown run status {status:?}")))?;
    let Json(options): Json<SyncOptions> = row.try_get("options")?;
    let Json(counts): Json<RunCounts> = row.try_get("counts")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
    Ok(SyncRun {
        id: row.try_get::<Uuid, _>("id")?,
        started_at: row.try_get("started_at")?,
        completed_at,
        status,
        options,
        counts,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl FingerprintStore for PgStore {
    async fn load_fingerprints(
        &self,
        record_ids: &[String],
    ) -> StoreResult<HashMap<String, TrackingFingerprint>> {
        if record_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT record_id, last_seen_modified_at, last_checked_at, content_hash, attribute_count
              FROM sync_fingerprints
             WHERE record_id = ANY($1)
            "#,
        )
        .bind(record_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let fingerprint = fingerprint_from_row(row)?;
            out.insert(fingerprint.record_id.clone(), fingerprint);
        }
        Ok(out)
    }

    async fn upsert_fingerprints(&self, rows: &[TrackingFingerprint]) -> StoreResult<u64> {
        let rows = dedup_last_wins(rows.iter().cloned(), |r| r.record_id.clone());
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sync_fingerprints (record_id, last_seen_modified_at, last_checked_at, content_hash, attribute_count) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.record_id)
                .push_bind(row.last_seen_modified_at)
                .push_bind(row.last_checked_at)
                .push_bind(row.content_hash)
                .push_bind(i32::try_from(row.attribute_count).unwrap_or(i32::MAX));
        });
        qb.push(
            r#"
            ON CONFLICT (record_id) DO UPDATE
               SET last_seen_modified_at = GREATEST(sync_fingerprints.last_seen_modified_at, EXCLUDED.last_seen_modified_at),
                   last_checked_at = EXCLUDED.last_checked_at,
                   content_hash = EXCLUDED.content_hash,
                   attribute_count = EXCLUDED.attribute_count
            "#,
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear_fingerprints(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sync_fingerprints")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn upsert_entities(&self, batch: &[NormalizedEntity]) -> StoreResult<u64> {
        let rows = dedup_last_wins(batch.iter().cloned(), |e| e.business_id.clone());
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sync_entities (business_id, title, status, owner, amount_cents, attributes, source_created_at, source_modified_at, content_hash) ",
        );
        qb.push_values(rows, |mut b, entity| {
            b.push_bind(entity.business_id)
                .push_bind(entity.title)
                .push_bind(entity.status)
                .push_bind(entity.owner)
                .push_bind(entity.amount_cents)
                .push_bind(Json(entity.attributes))
                .push_bind(entity.source_created_at)
                .push_bind(entity.source_modified_at)
                .push_bind(entity.content_hash);
        });
        qb.push(
            r#"
            ON CONFLICT (business_id) DO UPDATE
               SET title = EXCLUDED.title,
                   status = EXCLUDED.status,
                   owner = EXCLUDED.owner,
                   amount_cents = EXCLUDED.amount_cents,
                   attributes = EXCLUDED.attributes,
                   source_created_at = EXCLUDED.source_created_at,
                   source_modified_at = EXCLUDED.source_modified_at,
                   content_hash = EXCLUDED.content_hash,
                   version = sync_entities.version + 1,
                   updated_at = NOW()
            "#,
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_entities(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sync_entities")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn start_run(&self, run: &SyncRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, started_at, completed_at, status, options, counts, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(Json(&run.options))
        .bind(Json(&run.counts))
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET completed_at = $2,
                   status = $3,
                   counts = $4,
                   error_message = $5
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(Json(&run.counts))
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Malformed(format!("run {} was never started", run.id)));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, completed_at, status, options, counts, error_message
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
