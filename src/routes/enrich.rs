use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::model::Envelope;
use crate::pipeline::EnrichRequest;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnrichBody {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub has_attachment: bool,
}

/// `POST /enrich` — the Context Pipeline's main entry point (spec §4.6).
pub async fn enrich(
    State(state): State<AppState>,
    Json(body): Json<EnrichBody>,
) -> AppResult<Json<Envelope>> {
    if body.session_id.trim().is_empty() {
        return Err(crate::error::AppError::InvalidRequest(
            "session_id must not be empty".to_string(),
        ));
    }

    let envelope = state
        .pipeline
        .enrich(EnrichRequest {
            session_id: body.session_id,
            message: body.message,
            has_attachment: body.has_attachment,
        })
        .await?;

    Ok(Json(envelope))
}
