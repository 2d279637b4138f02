use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use deltasync_core::{BackoffPolicy, PageRequest};
use deltasync_source::{
    BatchFetcher, FetcherConfig, HttpSourceApi, RateLimit, SourceApi, SourceApiConfig, SourceError,
};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Default)]
struct Upstream {
    flaky_calls: AtomicUsize,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer test-key")
}

async fn records(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let offset: u64 = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: u64 = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(10);

    // The second page fails once before succeeding.
    if offset == 2 && upstream.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response();
    }

    let total = 5u64;
    let rows: Vec<_> = (offset..(offset + limit).min(total))
        .map(|i| {
            json!({
                "id": format!("r{i}"),
                "lastModifiedAt": "2026-02-24T12:00:00Z",
                "createdAt": "2026-01-01T00:00:00Z",
                "title": format!("Record {i}"),
                "status": "open"
            })
        })
        .collect();
    Json(json!({ "records": rows, "meta": { "total": total } })).into_response()
}

async fn attributes(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::FORBIDDEN, "nope").into_response();
    }
    let ids = params.get("ownerIdsIn").cloned().unwrap_or_default();
    let attrs: Vec<_> = ids
        .split(',')
        .filter(|id| !id.is_empty())
        .map(|id| json!({ "ownerId": id, "attributeKey": "region", "attributeValue": "emea" }))
        .collect();
    Json(json!({ "attributes": attrs })).into_response()
}

async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/api/records", get(records))
        .route("/api/attributes", get(attributes))
        .with_state(Arc::new(Upstream::default()));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

fn client(base_url: String, api_key: &str) -> HttpSourceApi {
    HttpSourceApi::new(SourceApiConfig {
        base_url,
        api_key: api_key.to_string(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn lists_pages_and_attributes_over_http() {
    let api = client(spawn_upstream().await, "test-key");

    let page = api.list_page(PageRequest { offset: 0, limit: 2 }).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[1].id, "r1");

    let attrs = api
        .fetch_attributes(&["r0".to_string(), "r4".to_string()])
        .await
        .unwrap();
    let owners: Vec<_> = attrs.attributes.iter().map(|a| a.owner_id.as_str()).collect();
    assert_eq!(owners, vec!["r0", "r4"]);
}

#[tokio::test]
async fn bad_credentials_surface_as_fatal_auth_errors() {
    let api = client(spawn_upstream().await, "wrong-key");
    let err = api
        .list_page(PageRequest { offset: 0, limit: 2 })
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Auth { status: 401 }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn fetcher_retries_a_transient_page_over_http() {
    let api = client(spawn_upstream().await, "test-key");
    let fetcher = BatchFetcher::new(FetcherConfig {
        rate_limit: RateLimit {
            batch_size: 2,
            min_batch_interval: Duration::from_millis(10),
        },
        retry: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_jitter: Duration::ZERO,
        },
        request_timeout: Duration::from_secs(5),
    });

    let pages = vec![
        PageRequest { offset: 0, limit: 2 },
        PageRequest { offset: 2, limit: 2 },
        PageRequest { offset: 4, limit: 2 },
    ];
    let outcome = fetcher
        .fetch_all(pages, None, |page| api.list_page(page))
        .await;

    assert!(outcome.failures.is_empty());
    let mut ids: Vec<String> = outcome
        .successes
        .into_iter()
        .flat_map(|(_, page)| page.records.into_iter().map(|r| r.id))
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["r0", "r1", "r2", "r3", "r4"]);
}
