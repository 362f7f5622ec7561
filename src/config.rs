use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum chunk text length in characters (spec default 1500).
pub const DEFAULT_CHUNK_SIZE: usize = 1500;
/// Overlap between adjacent chunks within the same file, in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 300;
/// Dimension of the embedding vectors produced by the embedding backend.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;

/// Closed set of corpus sources.
pub const SOURCES: &[&str] = &["memory", "chat", "chat_export"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub parallel_execution: bool,
    pub vector_index: bool,
    pub skip_logic: bool,
    pub embedding_cache: bool,
    pub route_aware_sources: bool,
    pub timing_stats: bool,
    pub history_compression: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            parallel_execution: true,
            vector_index: true,
            skip_logic: true,
            embedding_cache: true,
            route_aware_sources: true,
            timing_stats: true,
            history_compression: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,

    /// Path to the sqlite chunk-store database file.
    pub chunks_db_path: String,
    /// Directories the ingestion watcher scans, one per source.
    pub memory_dir: String,
    pub chat_dir: String,
    pub chat_export_dir: String,

    /// Base URL of the local embedding backend (loopback IPv4 explicitly).
    pub embedding_backend_url: String,
    pub embedding_model: String,
    /// Base URL of the local routing-classifier backend.
    pub router_backend_url: String,
    pub router_model: String,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_dimension: usize,
    pub top_k: usize,
    pub min_score: HashMap<String, f32>,
    pub overfetch: usize,

    pub watcher_poll_ms: u64,
    pub watcher_debounce_ms: u64,
    pub watcher_new_file_scan_ms: u64,

    pub index_stale_ms: u64,

    pub embedding_cache_size: usize,
    pub embedding_cache_ttl_ms: u64,

    pub enrichment_deadline_ms: u64,
    pub embedding_concurrency: usize,

    pub short_term_history_len: usize,
    pub routing_history_len: usize,
    pub assembly_history_len: usize,

    pub feature_flags: FeatureFlags,
}

impl AppConfig {
    /// Populate defaults, then apply environment-variable overrides
    /// (`ENRICH_*`), then deep-merge a TOML config file if one is found.
    pub fn load() -> Self {
        let mut config = Self::from_env();
        if let Some(path) = std::env::var("ENRICH_CONFIG_FILE")
            .ok()
            .filter(|p| !p.is_empty())
        {
            config.merge_file(&path);
        } else {
            let default_path = format!("{}/config.toml", config.data_dir);
            if std::path::Path::new(&default_path).exists() {
                config.merge_file(&default_path);
            }
        }
        config
    }

    fn from_env() -> Self {
        let port = std::env::var("ENRICH_PORT").unwrap_or_else(|_| "8088".to_string());

        let data_dir = std::env::var("ENRICH_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("enrichment-hub").to_string_lossy().to_string())
                .unwrap_or_else(|| ".enrichment-data".to_string())
        });

        let mut min_score = HashMap::new();
        min_score.insert("memory".to_string(), 0.3f32);
        min_score.insert("chat".to_string(), 0.3f32);
        min_score.insert("chat_export".to_string(), 0.3f32);

        Self {
            listen_addr: format!("127.0.0.1:{port}"),
            chunks_db_path: std::env::var("ENRICH_CHUNKS_DB")
                .unwrap_or_else(|_| format!("{data_dir}/chunks.db")),
            memory_dir: std::env::var("ENRICH_MEMORY_DIR")
                .unwrap_or_else(|_| format!("{data_dir}/transcripts/memory")),
            chat_dir: std::env::var("ENRICH_CHAT_DIR")
                .unwrap_or_else(|_| format!("{data_dir}/transcripts/chat")),
            chat_export_dir: std::env::var("ENRICH_CHAT_EXPORT_DIR")
                .unwrap_or_else(|_| format!("{data_dir}/transcripts/chat_export")),
            embedding_backend_url: std::env::var("ENRICH_EMBEDDING_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            embedding_model: std::env::var("ENRICH_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            router_backend_url: std::env::var("ENRICH_ROUTER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            router_model: std::env::var("ENRICH_ROUTER_MODEL")
                .unwrap_or_else(|_| "qwen2.5:7b".to_string()),
            chunk_size: env_parse("ENRICH_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            chunk_overlap: env_parse("ENRICH_CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP),
            embedding_dimension: env_parse("ENRICH_EMBEDDING_DIM", DEFAULT_EMBEDDING_DIMENSION),
            top_k: env_parse("ENRICH_TOP_K", 10),
            min_score,
            overfetch: env_parse("ENRICH_OVERFETCH", 3),
            watcher_poll_ms: env_parse("ENRICH_WATCHER_POLL_MS", 5000),
            watcher_debounce_ms: env_parse("ENRICH_WATCHER_DEBOUNCE_MS", 2000),
            watcher_new_file_scan_ms: env_parse("ENRICH_WATCHER_NEW_FILE_SCAN_MS", 30_000),
            index_stale_ms: env_parse("ENRICH_INDEX_STALE_MS", 60_000),
            embedding_cache_size: env_parse("ENRICH_EMBEDDING_CACHE_SIZE", 500),
            embedding_cache_ttl_ms: env_parse("ENRICH_EMBEDDING_CACHE_TTL_MS", 300_000),
            enrichment_deadline_ms: env_parse("ENRICH_DEADLINE_MS", 5000),
            embedding_concurrency: env_parse("ENRICH_EMBEDDING_CONCURRENCY", 4),
            short_term_history_len: env_parse("ENRICH_SHORT_TERM_HISTORY_LEN", 20),
            routing_history_len: env_parse("ENRICH_ROUTING_HISTORY_LEN", 3),
            assembly_history_len: env_parse("ENRICH_ASSEMBLY_HISTORY_LEN", 6),
            feature_flags: FeatureFlags::default(),
            data_dir,
        }
    }

    /// Deep-merge recognized keys from a TOML file over the current config.
    /// Unknown keys are warned about, not fatal.
    fn merge_file(&mut self, path: &str) {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path, error = %e, "config file not readable, skipping");
                return;
            }
        };
        let table: toml::Value = match toml::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path, error = %e, "config file failed to parse, skipping");
                return;
            }
        };
        let Some(table) = table.as_table() else {
            tracing::warn!(path, "config file is not a table, skipping");
            return;
        };

        macro_rules! merge_int {
            ($key:literal, $field:ident) => {
                if let Some(v) = table.get($key).and_then(|v| v.as_integer()) {
                    self.$field = v as _;
                }
            };
        }
        macro_rules! merge_str {
            ($key:literal, $field:ident) => {
                if let Some(v) = table.get($key).and_then(|v| v.as_str()) {
                    self.$field = v.to_string();
                }
            };
        }
        macro_rules! merge_bool {
            ($key:literal, $field:ident) => {
                if let Some(v) = table.get($key).and_then(|v| v.as_bool()) {
                    self.feature_flags.$field = v;
                }
            };
        }

        merge_int!("chunkSize", chunk_size);
        merge_int!("chunkOverlap", chunk_overlap);
        merge_int!("embeddingDimension", embedding_dimension);
        merge_int!("topK", top_k);
        merge_int!("overfetch", overfetch);
        merge_int!("watcherPollMs", watcher_poll_ms);
        merge_int!("watcherDebounceMs", watcher_debounce_ms);
        merge_int!("watcherNewFileScanMs", watcher_new_file_scan_ms);
        merge_int!("indexStaleMs", index_stale_ms);
        merge_int!("embeddingCacheSize", embedding_cache_size);
        merge_int!("embeddingCacheTtlMs", embedding_cache_ttl_ms);
        merge_int!("enrichmentDeadlineMs", enrichment_deadline_ms);
        merge_str!("chunksDbPath", chunks_db_path);

        if let Some(scores) = table.get("minScore").and_then(|v| v.as_table()) {
            for (source, v) in scores {
                if let Some(f) = v.as_float().or_else(|| v.as_integer().map(|i| i as f64)) {
                    self.min_score.insert(source.clone(), f as f32);
                }
            }
        }

        merge_bool!("parallelExecution", parallel_execution);
        merge_bool!("vectorIndex", vector_index);
        merge_bool!("skipLogic", skip_logic);
        merge_bool!("embeddingCache", embedding_cache);
        merge_bool!("routeAwareSources", route_aware_sources);
        merge_bool!("timingStats", timing_stats);
        merge_bool!("historyCompression", history_compression);

        let recognized = [
            "chunkSize",
            "chunkOverlap",
            "embeddingDimension",
            "topK",
            "overfetch",
            "watcherPollMs",
            "watcherDebounceMs",
            "watcherNewFileScanMs",
            "indexStaleMs",
            "embeddingCacheSize",
            "embeddingCacheTtlMs",
            "enrichmentDeadlineMs",
            "chunksDbPath",
            "minScore",
            "parallelExecution",
            "vectorIndex",
            "skipLogic",
            "embeddingCache",
            "routeAwareSources",
            "timingStats",
            "historyCompression",
        ];
        for key in table.keys() {
            if !recognized.contains(&key.as_str()) {
                tracing::warn!(key, "unrecognized config key ignored");
            }
        }
    }

    pub fn min_score_for(&self, source: &str) -> f32 {
        self.min_score.get(source).copied().unwrap_or(0.3)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
