use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::interval;

use crate::chunker::{group_into_chunks, normalize_line};
use crate::embedding::EmbedBackend;
use crate::error::AppError;
use crate::model::Chunk;
use crate::store::{content_hash, now_rfc3339, ChunkStore};
use crate::vector_index::VectorIndex;

/// Repeated-failure rate limiting: after this many consecutive failures for
/// the same file, only log once every `FAILURE_LOG_EVERY` ticks rather than
/// every tick (spec §4.5 "Repeated failures... are rate-limited and
/// logged").
const FAILURE_LOG_EVERY: u32 = 10;
const EMBED_BATCH_SIZE: usize = 10;

/// One watcher per source directory (memory / chat / chat_export). Files
/// within a watcher are processed sequentially; separate watchers for
/// separate sources run concurrently (spec §4.5 "Concurrency"), and all of
/// them share the single `ChunkStore` writer lock through its own internal
/// mutex.
pub struct IngestionWatcher {
    pub source: &'static str,
    dir: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    new_file_scan_interval: Duration,
    chunk_size: usize,
    chunk_overlap: usize,
    store: Arc<ChunkStore>,
    embedding_client: Arc<dyn EmbedBackend>,
    vector_index: Arc<VectorIndex>,
    embed_semaphore: Arc<Semaphore>,
    known_files: DashMap<String, ()>,
    failure_counts: DashMap<String, AtomicU32>,
}

impl IngestionWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'static str,
        dir: PathBuf,
        poll_interval: Duration,
        debounce: Duration,
        new_file_scan_interval: Duration,
        chunk_size: usize,
        chunk_overlap: usize,
        store: Arc<ChunkStore>,
        embedding_client: Arc<dyn EmbedBackend>,
        vector_index: Arc<VectorIndex>,
        embed_semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            source,
            dir,
            poll_interval,
            debounce,
            new_file_scan_interval,
            chunk_size,
            chunk_overlap,
            store,
            embedding_client,
            vector_index,
            embed_semaphore,
            known_files: DashMap::new(),
            failure_counts: DashMap::new(),
        }
    }

    /// Supervised worker loop: a panic inside one tick must not kill the
    /// watcher for the rest of the process lifetime (spec §9 "Callback-heavy
    /// watcher loops → supervised worker tasks"). `tokio::spawn` already
    /// isolates a panic to its own task, but we additionally keep looping on
    /// ordinary errors rather than returning.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.scan_for_new_files().await;
            let mut poll_timer = interval(self.poll_interval);
            let mut scan_timer = interval(self.new_file_scan_interval);
            loop {
                tokio::select! {
                    _ = poll_timer.tick() => {
                        self.tick().await;
                    }
                    _ = scan_timer.tick() => {
                        self.scan_for_new_files().await;
                    }
                }
            }
        })
    }

    async fn scan_for_new_files(&self) {
        let dir = self.dir.clone();
        let entries = tokio::task::spawn_blocking(move || list_files(&dir))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "new-file scan task panicked");
                Ok(Vec::new())
            });
        match entries {
            Ok(files) => {
                for file in files {
                    self.known_files.insert(file, ());
                }
            }
            Err(e) => tracing::warn!(source = self.source, error = %e, "directory listing failed"),
        }
    }

    async fn tick(&self) {
        let files: Vec<String> = self.known_files.iter().map(|e| e.key().clone()).collect();
        for path in files {
            if self.should_debounce(&path) {
                continue;
            }
            match self.process_file(&path).await {
                Ok(chunks_added) => {
                    self.failure_counts.remove(&path);
                    if chunks_added > 0 {
                        self.vector_index.invalidate();
                        tracing::info!(source = self.source, path, chunks_added, "ingest batch committed");
                    }
                }
                Err(e) => self.record_failure(&path, &e),
            }
        }
    }

    fn should_debounce(&self, path: &str) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return true;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < self.debounce,
            Err(_) => false,
        }
    }

    fn record_failure(&self, path: &str, error: &AppError) {
        let counter = self
            .failure_counts
            .entry(path.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % FAILURE_LOG_EVERY == 0 {
            tracing::warn!(source = self.source, path, count, error = %error, "ingest batch failed, offset untouched");
        }
    }

    /// Process one file's new bytes: read from the last committed offset to
    /// EOF-by-newline, parse + normalize + group into chunks, embed only
    /// chunks whose content hash is new, then commit everything (chunk
    /// upserts + offset advance) as a single transaction (spec §4.5).
    pub(crate) async fn process_file(&self, path: &str) -> Result<usize, AppError> {
        let progress = self.store.get_ingest_offset(path)?;
        let (new_text, new_offset) = read_new_complete_lines(path, progress.last_offset)?;
        if new_text.is_empty() {
            return Ok(0);
        }

        let messages: Vec<_> = new_text.lines().filter_map(normalize_line).collect();
        if messages.is_empty() {
            // Still advance the offset: these were blank/unparseable lines,
            // not a batch we failed to commit.
            self.store
                .set_ingest_offset(path, new_offset, progress.last_timestamp.as_deref(), 0)?;
            return Ok(0);
        }

        let drafts = group_into_chunks(&messages, self.chunk_size, self.chunk_overlap);
        let mut chunks = Vec::with_capacity(drafts.len());
        let mut to_embed_idx = Vec::new();
        let mut to_embed_text = Vec::new();

        for (i, draft) in drafts.iter().enumerate() {
            let hash = content_hash(&draft.text);
            let locator = format!("{path}:{}-{}", draft.start_ts_ms, draft.end_ts_ms);
            let reused = self.store.find_embedding_by_hash(&hash)?;
            let embedding = match reused {
                Some(v) => Some(v),
                None => {
                    to_embed_idx.push(i);
                    to_embed_text.push(draft.text.clone());
                    None
                }
            };
            chunks.push(Chunk {
                id: 0,
                source: self.source.to_string(),
                locator,
                text: draft.text.clone(),
                embedding,
                content_hash: hash,
                created_at: now_rfc3339(),
            });
        }

        if !to_embed_idx.is_empty() {
            let embeddings = self.embed_all(&to_embed_text).await?;
            for (slot, vector) in to_embed_idx.into_iter().zip(embeddings) {
                chunks[slot].embedding = Some(vector);
            }
        }

        let last_ts = drafts.last().map(|d| d.end_ts_ms.to_string());
        self.store
            .commit_ingest_batch(path, &chunks, new_offset, last_ts.as_deref())?;

        Ok(chunks.len())
    }

    /// Embed in batches of `EMBED_BATCH_SIZE`, gated by the shared
    /// process-wide semaphore (spec §5 "Back-pressure").
    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let _permit = self.embed_semaphore.acquire().await.expect("semaphore open");
            let refs: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();
            let embeddings = self.embedding_client.embed_batch(&refs).await?;
            out.extend(embeddings);
        }
        Ok(out)
    }
}

/// List regular files directly under `dir` (non-recursive: transcript
/// directories are flat by convention). Missing directories yield an empty
/// list rather than an error, since a source directory may not exist yet.
fn list_files(dir: &Path) -> Result<Vec<String>, AppError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            out.insert(entry.path().to_string_lossy().to_string());
        }
    }
    Ok(out.into_iter().collect())
}

/// Read from `offset` to EOF, but only up to the last complete line: a
/// trailing partial line (no terminating `\n` yet) is left unread so the
/// next tick picks it up once it's complete (spec §4.5 "Ignore partial
/// trailing lines").
fn read_new_complete_lines(path: &str, offset: u64) -> Result<(String, u64), AppError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok((String::new(), offset));
    };

    let complete = &buf[..=last_newline];
    let text = String::from_utf8_lossy(complete).into_owned();
    Ok((text, offset + complete.len() as u64))
}
