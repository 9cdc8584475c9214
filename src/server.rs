use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::attack::Attacker;
use crate::definitions::Definitions;
use crate::error::ApiError;
use crate::models::{Record, RecordId, RunReport, TestDefinition};

/// Shared state of every API handler
#[derive(Clone)]
pub struct AppState {
    pub definitions: Definitions,
    pub attacker: Arc<Attacker>,
    /// Cancels on-demand runs at shutdown
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub server_status: String,
    pub database_status: String,
    pub cache_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub count: Option<i64>,
    pub start: Option<i64>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/tests", post(create_test).get(list_tests))
        .route(
            "/v1/tests/{id}",
            get(get_test).put(update_test).delete(delete_test),
        )
        .route("/v1/tests/{id}/report", get(latest_report))
        .route("/v1/tests/{id}/run", post(run_test))
        .with_state(state)
}

/// Serve the API until `shutdown` fires, then drain open connections
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("API listening on http://{}", addr);
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_status = match state.definitions.store().healthy() {
        Ok(()) => "connected",
        Err(e) => {
            error!("Health check failed: {}", e);
            "not connected"
        }
    };

    Json(HealthResponse {
        server_status: "ok".to_string(),
        database_status: database_status.to_string(),
        cache_count: state.definitions.cache().entry_count(),
    })
}

async fn create_test(
    State(state): State<AppState>,
    Json(definition): Json<TestDefinition>,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    if definition.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    let record = state.definitions.create(&definition)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_tests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    Ok(Json(state.definitions.list(query.count, query.start)?))
}

async fn get_test(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<Record>, ApiError> {
    Ok(Json(state.definitions.get(id)?))
}

async fn update_test(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
    Json(definition): Json<TestDefinition>,
) -> Result<Json<Record>, ApiError> {
    if definition.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    Ok(Json(state.definitions.update(id, &definition)?))
}

async fn delete_test(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<StatusCode, ApiError> {
    state.definitions.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Latest persisted report, `null` when the definition never ran
async fn latest_report(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<Option<serde_json::Value>>, ApiError> {
    let report = state.definitions.latest_report(id)?;
    Ok(Json(report.map(|record| record.data)))
}

/// Run a stored definition now and return its report without persisting it
async fn run_test(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<RunReport>, ApiError> {
    let definition = state.definitions.get(id)?.definition()?;
    let cancel = state.shutdown.child_token();
    let report = state.attacker.run_once(&definition, &cancel).await?;
    Ok(Json(report))
}
