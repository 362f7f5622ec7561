use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::embedding::{EmbedBackend, EmbeddingClient};
use crate::error::AppResult;
use crate::pipeline::ContextPipeline;
use crate::routing::{RouteClassifier, RoutingClient};
use crate::search::QueryEmbeddingCache;
use crate::store::ChunkStore;
use crate::vector_index::VectorIndex;
use crate::watcher::IngestionWatcher;

/// Shared application state handed to every route handler. Construction
/// wires the six components together in dependency order: store, then
/// index/cache/clients that read from it, then the watchers that write to
/// it, then the pipeline that ties search + routing together.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<ChunkStore>,
    pub index: Arc<VectorIndex>,
    pub pipeline: Arc<ContextPipeline>,
    pub embedding_client: Arc<dyn EmbedBackend>,
    pub embed_semaphore: Arc<Semaphore>,
    watcher_handles: Arc<Vec<tokio::task::JoinHandle<()>>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = Arc::new(ChunkStore::open(&config.chunks_db_path)?);
        let index = Arc::new(VectorIndex::new(
            config.embedding_dimension,
            Duration::from_millis(config.index_stale_ms),
        ));
        let cache = Arc::new(QueryEmbeddingCache::new(
            config.embedding_cache_size,
            Duration::from_millis(config.embedding_cache_ttl_ms),
        ));
        let embedding_client: Arc<dyn EmbedBackend> = Arc::new(EmbeddingClient::new(
            config.embedding_backend_url.clone(),
            config.embedding_model.clone(),
            config.embedding_dimension,
        ));
        let routing_client: Arc<dyn RouteClassifier> = Arc::new(RoutingClient::new(
            config.router_backend_url.clone(),
            config.router_model.clone(),
        ));
        let embed_semaphore = Arc::new(Semaphore::new(config.embedding_concurrency));

        let pipeline = Arc::new(ContextPipeline::new(
            config.clone(),
            embedding_client.clone(),
            routing_client.clone(),
            cache.clone(),
            index.clone(),
            store.clone(),
            embed_semaphore.clone(),
        ));

        let watcher_handles = spawn_watchers(&config, &store, &embedding_client, &index, &embed_semaphore);

        Ok(Self {
            config,
            store,
            index,
            pipeline,
            embedding_client,
            embed_semaphore,
            watcher_handles: Arc::new(watcher_handles),
        })
    }

    /// Number of ingestion watchers currently running, surfaced in
    /// `GET /health`.
    pub fn watcher_count(&self) -> usize {
        self.watcher_handles.len()
    }
}

fn spawn_watchers(
    config: &Arc<AppConfig>,
    store: &Arc<ChunkStore>,
    embedding_client: &Arc<dyn EmbedBackend>,
    index: &Arc<VectorIndex>,
    embed_semaphore: &Arc<Semaphore>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let sources: [(&'static str, &str); 3] = [
        ("memory", &config.memory_dir),
        ("chat", &config.chat_dir),
        ("chat_export", &config.chat_export_dir),
    ];

    sources
        .into_iter()
        .map(|(source, dir)| {
            let watcher = Arc::new(IngestionWatcher::new(
                source,
                std::path::PathBuf::from(dir),
                Duration::from_millis(config.watcher_poll_ms),
                Duration::from_millis(config.watcher_debounce_ms),
                Duration::from_millis(config.watcher_new_file_scan_ms),
                config.chunk_size,
                config.chunk_overlap,
                store.clone(),
                embedding_client.clone(),
                index.clone(),
                embed_semaphore.clone(),
            ));
            watcher.spawn()
        })
        .collect()
}
