use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::SOURCES;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::watcher::IngestionWatcher;

#[derive(Debug, Deserialize)]
pub struct ReindexBody {
    pub source: String,
    /// Restrict to a single file path; omit to reindex every known file for
    /// the source.
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReindexResponse {
    pub source: String,
    pub chunks: usize,
}

/// `POST /reindex` — drops a source (or one file within it) from the Chunk
/// Store, resets its ingest offset to byte zero, then re-ingests it
/// synchronously on this request rather than waiting for the background
/// watcher's next tick, and invalidates the Vector Index so the following
/// search sees the change (spec §4.3 "Loading", §4.5, §6 "`POST /reindex
/// {source}` → `{chunks}` after full reindex").
pub async fn reindex(
    State(state): State<AppState>,
    Json(body): Json<ReindexBody>,
) -> AppResult<Json<ReindexResponse>> {
    if !SOURCES.contains(&body.source.as_str()) {
        return Err(AppError::InvalidRequest(format!(
            "unknown source '{}', expected one of {:?}",
            body.source, SOURCES
        )));
    }

    let files = match &body.path {
        Some(path) => {
            state.store.delete_by_source(&body.source, path)?;
            state.store.reset_ingest_progress(path)?;
            vec![path.clone()]
        }
        None => {
            state.store.delete_by_source(&body.source, "")?;
            let dir = source_dir(&state, &body.source);
            let files = list_files_best_effort(&dir);
            for file in &files {
                state.store.reset_ingest_progress(file)?;
            }
            files
        }
    };

    let source: &'static str = SOURCES
        .iter()
        .find(|s| **s == body.source)
        .copied()
        .expect("source validated above");
    let watcher = IngestionWatcher::new(
        source,
        std::path::PathBuf::from(source_dir(&state, &body.source)),
        Duration::from_millis(state.config.watcher_poll_ms),
        Duration::from_millis(state.config.watcher_debounce_ms),
        Duration::from_millis(state.config.watcher_new_file_scan_ms),
        state.config.chunk_size,
        state.config.chunk_overlap,
        state.store.clone(),
        state.embedding_client.clone(),
        state.index.clone(),
        state.embed_semaphore.clone(),
    );

    for file in &files {
        watcher.process_file(file).await?;
    }

    state.index.invalidate();

    let chunks = state.store.chunk_count(Some(&body.source))?;

    Ok(Json(ReindexResponse {
        source: body.source,
        chunks,
    }))
}

fn source_dir(state: &AppState, source: &str) -> String {
    match source {
        "memory" => state.config.memory_dir.clone(),
        "chat" => state.config.chat_dir.clone(),
        "chat_export" => state.config.chat_export_dir.clone(),
        _ => String::new(),
    }
}

fn list_files_best_effort(dir: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.path().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}
