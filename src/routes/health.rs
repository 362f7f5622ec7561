use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static SHUTDOWN_NOTIFY: OnceLock<Arc<Notify>> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn init_shutdown_notify() -> Arc<Notify> {
    SHUTDOWN_NOTIFY.get_or_init(|| Arc::new(Notify::new())).clone()
}

pub async fn wait_for_shutdown() {
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notified().await;
    } else {
        std::future::pending::<()>().await;
    }
}

/// Component-level health breakdown: the chunk store's integrity, the
/// vector index's loaded/degraded state, and the ingestion watchers'
/// liveness, alongside the plain uptime probe the teacher's `/health`
/// exposed.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);

    let index_stats = state.index.stats();
    let chunk_count = state.store.chunk_count(None).unwrap_or(0);

    Json(json!({
        "status": "ok",
        "service": "enrichment-hub",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "components": {
            "chunk_store": {
                "chunk_count": chunk_count,
            },
            "vector_index": {
                "loaded": index_stats.loaded,
                "rows": index_stats.rows,
                "degraded": index_stats.degraded,
            },
            "ingestion_watchers": {
                "running": state.watcher_count(),
            },
        },
    }))
}

pub async fn shutdown_handler() -> Json<Value> {
    tracing::info!("shutdown requested via HTTP endpoint");
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notify_one();
    }
    Json(json!({ "status": "shutting_down" }))
}
