mod common;

use arquebus::cache::IndexCache;
use arquebus::definitions::Definitions;
use arquebus::server::{AppState, HealthResponse, build_router};
use arquebus::{AttackConfig, Attacker, MemoryStorage, Record, RunReport};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Harness {
    store: Arc<MemoryStorage>,
    cache: IndexCache,
    router: Router,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStorage::new());
    let cache = IndexCache::new(1_000_000, Duration::from_secs(3600));
    let state = AppState {
        definitions: Definitions::new(store.clone(), cache.clone()),
        attacker: Arc::new(Attacker::new(AttackConfig::default()).unwrap()),
        shutdown: CancellationToken::new(),
    };
    Harness {
        store,
        cache,
        router: build_router(state),
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

fn smoke() -> Value {
    common::definition("smoke", "http://127.0.0.1:8080/health", 10, "2s")
}

#[tokio::test]
async fn health_reports_database_and_cache() {
    let h = harness();
    let (status, body) = send(&h.router, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = decode(&body);
    assert_eq!(health.server_status, "ok");
    assert_eq!(health.database_status, "connected");
    assert_eq!(health.cache_count, 0);

    send(&h.router, Method::POST, "/v1/tests", Some(smoke())).await;
    h.store.set_available(false);
    let (status, body) = send(&h.router, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = decode(&body);
    assert_eq!(health.database_status, "not connected");
    assert_eq!(health.cache_count, 1);
}

#[tokio::test]
async fn definition_crud() {
    let h = harness();

    let (status, body) = send(&h.router, Method::POST, "/v1/tests", Some(smoke())).await;
    assert_eq!(status, StatusCode::CREATED);
    let created: Record = decode(&body);
    assert_eq!(created.name, "smoke");
    assert_eq!(h.cache.record("smoke"), Some(created.clone()));

    let uri = format!("/v1/tests/{}", created.id);
    let (status, body) = send(&h.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode::<Record>(&body), created);

    let changed = common::definition("smoke-v2", "http://127.0.0.1:8080/health", 20, "5s");
    let (status, body) = send(&h.router, Method::PUT, &uri, Some(changed)).await;
    assert_eq!(status, StatusCode::OK);
    let updated: Record = decode(&body);
    assert_eq!(updated.data["rate"], 20);
    assert!(h.cache.get("smoke").is_none());

    let (status, _) = send(&h.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.cache.get("smoke-v2").is_none());

    let (status, body) = send(&h.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: Value = decode(&body);
    assert!(error["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    let (status, _) = send(&h.router, Method::DELETE, "/v1/tests/4242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.router, Method::PUT, "/v1/tests/4242", Some(smoke())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.router, Method::GET, "/v1/tests/4242/report", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_pages_and_clamps() {
    let h = harness();
    let (status, body) = send(&h.router, Method::GET, "/v1/tests", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(decode::<Vec<Record>>(&body).is_empty());

    for i in 0..12 {
        let definition = common::definition(&format!("t{i}"), "http://127.0.0.1:8080/", 1, "1s");
        send(&h.router, Method::POST, "/v1/tests", Some(definition)).await;
    }

    let (_, body) = send(&h.router, Method::GET, "/v1/tests", None).await;
    assert_eq!(decode::<Vec<Record>>(&body).len(), 10);

    let (_, body) = send(&h.router, Method::GET, "/v1/tests?count=5&start=10", None).await;
    let page: Vec<Record> = decode(&body);
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].name, "t10");

    let (_, body) = send(&h.router, Method::GET, "/v1/tests?count=0&start=-4", None).await;
    let page: Vec<Record> = decode(&body);
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].name, "t0");
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let h = harness();
    let (status, _) = send(&h.router, Method::POST, "/v1/tests", Some(json!({"name": "x"}))).await;
    assert!(status.is_client_error());

    let nameless = common::definition(" ", "http://127.0.0.1:8080/", 1, "1s");
    let (status, _) = send(&h.router, Method::POST, "/v1/tests", Some(nameless)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn run_now_returns_an_unpersisted_report() {
    let target = common::spawn_target().await;
    let h = harness();
    let definition = common::definition("now", &target.url("/health"), 10, "500ms");
    let (_, body) = send(&h.router, Method::POST, "/v1/tests", Some(definition)).await;
    let created: Record = decode(&body);

    let (status, body) = send(&h.router, Method::POST, &format!("/v1/tests/{}/run", created.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let report: RunReport = decode(&body);
    assert!(report.requests > 0);
    assert_eq!(report.success, report.requests);

    let (status, body) = send(&h.router, Method::GET, &format!("/v1/tests/{}/report", created.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode::<Value>(&body), Value::Null);
}

#[tokio::test]
async fn running_an_invalid_definition_is_a_bad_request() {
    let h = harness();
    let definition = common::definition("broken", "http://127.0.0.1:8080/", -1, "1s");
    let (_, body) = send(&h.router, Method::POST, "/v1/tests", Some(definition)).await;
    let created: Record = decode(&body);

    let (status, body) = send(&h.router, Method::POST, &format!("/v1/tests/{}/run", created.id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = decode(&body);
    assert!(error["error"].as_str().unwrap().contains("invalid rate"));
}
