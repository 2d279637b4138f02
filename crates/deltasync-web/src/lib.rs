//! Axum trigger API for the sync engine.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use deltasync_core::SyncOptions;
use deltasync_sync::{engine_from_env, maybe_build_scheduler, SyncEngine, TriggerError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "deltasync-web";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let engine = Arc::new(engine_from_env().await?);
    let port = engine.config().web_port;

    let scheduler = maybe_build_scheduler(engine.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %engine.config().sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger api listening");
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "running": state.engine.is_running(),
    }))
    .into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let options: SyncOptions = if body.iter().all(u8::is_ascii_whitespace) {
        SyncOptions::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(options) => options,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("invalid sync options: {err}")),
        }
    };

    match state.engine.run_exclusive(options).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ TriggerError::RunInProgress) => error_response(StatusCode::CONFLICT, err.to_string()),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    match state.engine.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => {
            warn!(%err, "loading run ledger failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use deltasync_core::{RunStatus, SourceRecord, SyncSummary};
    use deltasync_source::MemorySource;
    use deltasync_store::MemoryStore;
    use deltasync_sync::SyncConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn records(count: usize) -> Vec<SourceRecord> {
        let ts = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).single().unwrap();
        (0..count)
            .map(|i| SourceRecord {
                id: format!("w{i}"),
                last_modified_at: ts,
                created_at: ts,
                title: format!("Web {i}"),
                status: "open".into(),
                owner: None,
                amount_cents: None,
            })
            .collect()
    }

    fn engine(store: Arc<MemoryStore>) -> Arc<SyncEngine> {
        let config = SyncConfig {
            api_base_url: Some("https://api.example.test".into()),
            api_key: Some("k".into()),
            min_batch_interval_ms: 10,
            ..SyncConfig::default()
        };
        let source = Arc::new(MemorySource::new(records(12), vec![]));
        Arc::new(SyncEngine::new(config, source, store))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_sync(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/sync")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn healthz_reports_idle_engine() {
        let app = app(AppState::new(engine(Arc::new(MemoryStore::new()))));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn post_sync_runs_and_returns_the_summary() {
        let store = Arc::new(MemoryStore::new());
        let app = app(AppState::new(engine(store.clone())));

        let resp = app.clone().oneshot(post_sync("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: SyncSummary = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.total_written, 12);
        assert_eq!(store.entity_count(), 12);

        let resp = app.clone().oneshot(post_sync(r#"{"dry_run": true}"#)).await.unwrap();
        let summary: SyncSummary = serde_json::from_value(body_json(resp).await).unwrap();
        assert!(summary.options.dry_run);
        assert_eq!(summary.to_process, 0);

        let resp = app
            .oneshot(Request::builder().uri("/runs?limit=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runs = body_json(resp).await;
        assert_eq!(runs.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_options_are_rejected() {
        let app = app(AppState::new(engine(Arc::new(MemoryStore::new()))));
        let resp = app.oneshot(post_sync(r#"{"dry_run": "maybe"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_during_a_run_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store.set_upsert_delay(Some(Duration::from_secs(3)));
        let engine = engine(store);
        let app = app(AppState::new(engine.clone()));

        let background = engine.clone();
        let first = tokio::spawn(async move { background.run_once(SyncOptions::default()).await });
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        let resp = app.oneshot(post_sync("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("in progress"));

        assert_eq!(first.await.unwrap().status, RunStatus::Completed);
    }
}
