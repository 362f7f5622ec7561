use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::pipeline::StatsSnapshot;
use crate::state::AppState;
use crate::vector_index::IndexStats;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pipeline: StatsSnapshot,
    pub index: IndexStats,
    pub chunk_count: usize,
}

/// `GET /stats` — running counters and a bounded recent-decision window
/// from the Context Pipeline, plus the Vector Index's load state.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pipeline: state.pipeline.stats_snapshot(),
        index: state.index.stats(),
        chunk_count: state.store.chunk_count(None).unwrap_or(0),
    })
}
