#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Local HTTP server the attacker is pointed at
pub struct Target {
    pub addr: SocketAddr,
    hits: Arc<AtomicU64>,
}

impl Target {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests received so far, on any route
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}

type Hits = Arc<AtomicU64>;

async fn health(State(hits): State<Hits>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    "ok"
}

async fn missing(State(hits): State<Hits>) -> (StatusCode, &'static str) {
    hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "nope")
}

async fn slow(State(hits): State<Hits>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

/// Routes: `/health` answers 200, `/missing` 404, `/slow` after 5s
pub async fn spawn_target() -> Target {
    let hits: Hits = Arc::new(AtomicU64::new(0));
    let app = Router::new()
        .route("/health", get(health))
        .route("/missing", get(missing))
        .route("/slow", get(slow))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Target { addr, hits }
}

/// An address nothing listens on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn definition(name: &str, url: &str, rate: i64, duration: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "url": url,
        "method": "GET",
        "rate": rate,
        "duration": duration,
    })
}
