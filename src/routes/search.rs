use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::model::{Route, RagHit};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub top_k: Option<usize>,
    /// Comma-separated source list, e.g. `memory,chat`. Empty means all.
    pub sources: Option<String>,
    /// Optional route hint to apply the same route-aware trim a pipeline
    /// enrich call would (spec §4.4 step 7).
    pub route: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<RagHit>,
    pub cache_hit: bool,
    pub degraded: bool,
}

/// `GET /search` — the Unified Search component exposed directly, without
/// the routing/skip-check machinery the full enrich pipeline adds.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResponse>> {
    if params.q.trim().is_empty() {
        return Err(AppError::InvalidRequest("q must not be empty".to_string()));
    }

    let sources: Vec<&str> = params
        .sources
        .as_deref()
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let route_hint = match params.route.as_deref() {
        Some(r) => Some(
            Route::parse(r)
                .ok_or_else(|| AppError::InvalidRequest(format!("unknown route '{r}'")))?,
        ),
        None => None,
    };

    let outcome = state
        .pipeline
        .search_only(&params.q, params.top_k.unwrap_or(0), &sources, route_hint)
        .await?;

    Ok(Json(SearchResponse {
        hits: outcome.hits,
        cache_hit: outcome.cache_hit,
        degraded: outcome.degraded,
    }))
}
