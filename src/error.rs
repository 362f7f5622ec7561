use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds named in the enrichment design. `CacheMiss` has no variant
/// here: it is informational only and represented as `Option::None`, never
/// propagated as a `Result` error.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("corpus corrupt: {0}")]
    CorpusCorrupt(String),

    #[error("ingest batch failed for {path}: {reason}")]
    IngestPartialFailure { path: String, reason: String },

    #[error("enrichment deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::CorpusCorrupt(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::UpstreamUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::MalformedResponse(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::IngestPartialFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Io(_) | AppError::Sqlite(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
