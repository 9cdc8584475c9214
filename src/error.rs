use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::models::RecordId;

/// A definition that cannot be run as written
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid rate {0}: must be a positive number of requests per second")]
    InvalidRate(i64),

    #[error("invalid duration `{0}`: {1}")]
    InvalidDuration(String, String),

    #[error("invalid target `{0}`: {1}")]
    InvalidUrl(String, String),

    #[error("invalid method `{0}`")]
    InvalidMethod(String),

    #[error("malformed definition {0}: {1}")]
    Malformed(RecordId, String),
}

#[derive(Debug, thiserror::Error)]
pub enum AttackError {
    #[error("rate must be greater than zero")]
    InvalidRate,

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unknown collection `{0}`")]
    UnknownCollection(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the HTTP API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Attack(#[from] AttackError),
}

impl From<DefinitionError> for ApiError {
    fn from(err: DefinitionError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::UnknownCollection(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Attack(AttackError::Definition(_)) => StatusCode::BAD_REQUEST,
            ApiError::Attack(AttackError::InvalidRate) => StatusCode::BAD_REQUEST,
            ApiError::Attack(AttackError::Client(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
