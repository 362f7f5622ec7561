//! End-to-end coverage of the context enrichment pipeline, driven against
//! in-process fakes of the embedding backend and routing classifier so the
//! six scenarios and testable properties can be exercised without a real
//! local model server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use enrichment_hub::config::{AppConfig, FeatureFlags};
use enrichment_hub::embedding::EmbedBackend;
use enrichment_hub::error::AppError;
use enrichment_hub::model::{Chunk, Confidence, Priority, Route, RouteDecision};
use enrichment_hub::pipeline::{ContextPipeline, EnrichRequest};
use enrichment_hub::routing::RouteClassifier;
use enrichment_hub::search::QueryEmbeddingCache;
use enrichment_hub::store::{now_rfc3339, ChunkStore};
use enrichment_hub::vector_index::VectorIndex;

const DIM: usize = 8;

/// Deterministic stand-in for the embedding backend. Exact vectors can be
/// pinned per query/chunk text via `fixed`, which is how tests get
/// hand-verifiable cosine scores without a real model; anything not pinned
/// falls back to a low-amplitude hash-based vector so unrelated text never
/// collides with a pinned one.
struct FakeEmbedder {
    fixed: HashMap<String, Vec<f32>>,
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    fn new() -> Self {
        Self {
            fixed: HashMap::new(),
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pins a vector for a query/chunk text, keyed the same way the query
    /// cache canonicalizes keys (lowercase, trimmed, whitespace-collapsed)
    /// so tests don't have to match case/whitespace exactly between the
    /// message a caller sends and the text a chunk was ingested under.
    fn with_fixed(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.fixed.insert(QueryEmbeddingCache::canonicalize(text), vector);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn always_fails(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.get(&QueryEmbeddingCache::canonicalize(text)) {
            return v.clone();
        }
        let mut v = vec![0.0f32; DIM];
        let h = text.bytes().fold(1u64, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u64));
        v[(h as usize) % DIM] = 1.0;
        v
    }
}

#[async_trait]
impl EmbedBackend for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("fake embedder down".to_string()));
        }
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Deterministic stand-in for the routing classifier: returns whatever
/// decision the test configured, after optional injected delay/failure.
struct FakeRouter {
    decision: RouteDecision,
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeRouter {
    fn new(decision: RouteDecision) -> Self {
        Self {
            decision,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn always_fails(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteClassifier for FakeRouter {
    async fn classify(&self, _message: &str, _recent_history: &[String]) -> Result<RouteDecision, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("fake router down".to_string()));
        }
        Ok(self.decision.clone())
    }

    async fn summarize(&self, messages: &[String]) -> Result<String, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("fake router down".to_string()));
        }
        Ok(format!("summary of {} messages", messages.len()))
    }
}

fn test_config() -> AppConfig {
    let mut min_score = HashMap::new();
    min_score.insert("memory".to_string(), 0.1f32);
    min_score.insert("chat".to_string(), 0.1f32);
    min_score.insert("chat_export".to_string(), 0.1f32);

    AppConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        data_dir: "/tmp".to_string(),
        chunks_db_path: ":memory:".to_string(),
        memory_dir: "/tmp/enrich-test-memory".to_string(),
        chat_dir: "/tmp/enrich-test-chat".to_string(),
        chat_export_dir: "/tmp/enrich-test-chat-export".to_string(),
        embedding_backend_url: "http://127.0.0.1:1".to_string(),
        embedding_model: "fake".to_string(),
        router_backend_url: "http://127.0.0.1:1".to_string(),
        router_model: "fake".to_string(),
        chunk_size: 1500,
        chunk_overlap: 300,
        embedding_dimension: DIM,
        top_k: 10,
        min_score,
        overfetch: 3,
        watcher_poll_ms: 5000,
        watcher_debounce_ms: 2000,
        watcher_new_file_scan_ms: 30_000,
        index_stale_ms: 60_000,
        embedding_cache_size: 500,
        embedding_cache_ttl_ms: 300_000,
        enrichment_deadline_ms: 5000,
        embedding_concurrency: 4,
        short_term_history_len: 20,
        routing_history_len: 3,
        assembly_history_len: 6,
        feature_flags: FeatureFlags::default(),
    }
}

struct Harness {
    store: Arc<ChunkStore>,
    index: Arc<VectorIndex>,
    pipeline: Arc<ContextPipeline>,
    embedder: Arc<FakeEmbedder>,
    router: Arc<FakeRouter>,
}

fn build_harness(config: AppConfig, embedder: FakeEmbedder, router: FakeRouter) -> Harness {
    let config = Arc::new(config);
    let store = Arc::new(ChunkStore::open(":memory:").expect("open in-memory store"));
    let index = Arc::new(VectorIndex::new(config.embedding_dimension, Duration::from_millis(config.index_stale_ms)));
    let cache = Arc::new(QueryEmbeddingCache::new(config.embedding_cache_size, Duration::from_millis(config.embedding_cache_ttl_ms)));
    let embedder = Arc::new(embedder);
    let router = Arc::new(router);

    let embed_backend: Arc<dyn EmbedBackend> = embedder.clone();
    let route_classifier: Arc<dyn RouteClassifier> = router.clone();

    let embed_semaphore = Arc::new(tokio::sync::Semaphore::new(config.embedding_concurrency));

    let pipeline = Arc::new(ContextPipeline::new(
        config,
        embed_backend,
        route_classifier,
        cache,
        index.clone(),
        store.clone(),
        embed_semaphore,
    ));

    Harness { store, index, pipeline, embedder, router }
}

fn chunk(source: &str, locator: &str, text: &str, embedding: Vec<f32>) -> Chunk {
    Chunk {
        id: 0,
        source: source.to_string(),
        locator: locator.to_string(),
        text: text.to_string(),
        embedding: Some(embedding),
        content_hash: enrichment_hub::store::content_hash(text),
        created_at: now_rfc3339(),
    }
}

fn sonnet_medium() -> RouteDecision {
    RouteDecision {
        route: Route::Sonnet,
        reason: "default".to_string(),
        priority: Priority::Medium,
        confidence: Confidence::Medium,
        fallback_chain: vec![Route::Sonnet, Route::Haiku],
    }
}

// --- Scenario 1: cold query against an empty corpus -----------------------

#[tokio::test]
async fn scenario_cold_query_empty_corpus() {
    let h = build_harness(test_config(), FakeEmbedder::new(), FakeRouter::new(sonnet_medium()));

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-a".to_string(),
            message: "Explain the routing architecture in this system, please".to_string(),
            has_attachment: false,
        })
        .await
        .expect("enrich succeeds even with an empty corpus");

    assert!(envelope.rag_context.is_empty());
    assert!(!envelope.metadata.skipped);
    assert!(!envelope.metadata.degraded);
    assert_eq!(envelope.route_decision.route, Route::Sonnet);
}

// --- Scenario 2: short acknowledgement is skipped --------------------------

#[tokio::test]
async fn scenario_skip_short_ack() {
    let h = build_harness(test_config(), FakeEmbedder::new(), FakeRouter::new(sonnet_medium()));

    // Prime the session so a repeat-window skip isn't what fires here.
    h.pipeline
        .enrich(EnrichRequest {
            session_id: "session-b".to_string(),
            message: "Explain the routing architecture in this system, please".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    let before_embed_calls = h.embedder.call_count();
    let before_route_calls = h.router.call_count();

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-b".to_string(),
            message: "ok".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    assert!(envelope.metadata.skipped);
    assert!(envelope.rag_context.is_empty());
    assert_eq!(envelope.route_decision.route, Route::Haiku);
    assert_eq!(envelope.route_decision.priority, Priority::Low);

    // P6: a skipped request never calls out to the embedding backend or the
    // routing classifier.
    assert_eq!(h.embedder.call_count(), before_embed_calls);
    assert_eq!(h.router.call_count(), before_route_calls);
}

// --- Scenario 3: repeat query within the cache TTL is a cache hit (P3) -----

#[tokio::test]
async fn scenario_repeat_query_is_cache_hit() {
    let query = "explain the routing architecture";
    let embedder = FakeEmbedder::new().with_fixed(query, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    let h = build_harness(test_config(), embedder, FakeRouter::new(sonnet_medium()));

    h.store
        .upsert_batch(&[chunk(
            "memory",
            "note-1",
            "a relevant memory about the routing architecture",
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )])
        .unwrap();
    h.index.invalidate();

    // Two distinct sessions so the rapid-repeat skip heuristic (same
    // session, < 5s apart) doesn't fire and mask what's under test here:
    // the query embedding cache, which is keyed on canonicalized text and
    // shared across sessions.
    let first = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-c1".to_string(),
            message: "Explain the Routing Architecture".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();
    assert!(!first.metadata.cache_hit);

    let calls_after_first = h.embedder.call_count();

    let second = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-c2".to_string(),
            message: "  explain   the routing architecture  ".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    assert!(second.metadata.cache_hit);
    assert_eq!(h.embedder.call_count(), calls_after_first, "cache hit must not call the embedding backend again");

    let first_locators: Vec<_> = first.rag_context.iter().map(|h| h.locator.clone()).collect();
    let second_locators: Vec<_> = second.rag_context.iter().map(|h| h.locator.clone()).collect();
    assert_eq!(first_locators, second_locators);
    assert!(!first_locators.is_empty());
}

// --- Feature flags: embeddingCache and vectorIndex are real toggles --------

#[tokio::test]
async fn embedding_cache_flag_disabled_reembeds_every_repeat_query() {
    let query = "explain the routing architecture";
    let embedder = FakeEmbedder::new().with_fixed(query, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    let mut config = test_config();
    config.feature_flags.embedding_cache = false;
    let h = build_harness(config, embedder, FakeRouter::new(sonnet_medium()));

    let calls_before = h.embedder.call_count();
    let first = h.pipeline.search_only(query, 5, &["memory"], None).await.unwrap();
    let second = h.pipeline.search_only(query, 5, &["memory"], None).await.unwrap();

    assert!(!first.cache_hit);
    assert!(!second.cache_hit, "embeddingCache=false must never report a cache hit");
    assert_eq!(
        h.embedder.call_count(),
        calls_before + 2,
        "embeddingCache=false must re-embed on every query, even a repeat"
    );
}

#[tokio::test]
async fn vector_index_flag_disabled_still_finds_results_via_linear_scan() {
    let query = "what is zymurgy-42";
    let embedder = FakeEmbedder::new().with_fixed(query, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    let mut config = test_config();
    config.feature_flags.vector_index = false;
    let h = build_harness(config, embedder, FakeRouter::new(sonnet_medium()));

    h.store
        .upsert_batch(&[chunk(
            "memory",
            "note-1",
            "zymurgy-42 is the answer to the question",
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )])
        .unwrap();
    // Deliberately do not invalidate/load the in-memory index snapshot: with
    // vectorIndex disabled, the search must go straight to the store's
    // linear scan and find the chunk regardless.

    let outcome = h.pipeline.search_only(query, 5, &["memory"], None).await.unwrap();
    assert!(!outcome.degraded, "disabling vectorIndex by config is not the same as a failure");
    assert_eq!(outcome.hits.len(), 1);
    assert!(outcome.hits[0].text.contains("zymurgy-42"));
}

#[tokio::test]
async fn history_compression_flag_summarizes_older_messages_once_budget_exceeded() {
    let embedder = FakeEmbedder::new();
    let mut config = test_config();
    config.feature_flags.history_compression = true;
    let h = build_harness(config, embedder, FakeRouter::new(sonnet_medium()));

    let session_id = "session-compress";
    // assembly_history_len is 6; six distinct 700-char messages exceed the
    // 4000-char compression budget and should collapse the oldest two into
    // one summary message, keeping the last four verbatim.
    for i in 0..6 {
        h.pipeline
            .enrich(EnrichRequest {
                session_id: session_id.to_string(),
                message: format!("msg-{i}-{}", "x".repeat(700)),
                has_attachment: false,
            })
            .await
            .unwrap();
    }

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: session_id.to_string(),
            message: "what did we discuss earlier".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    let summary = envelope
        .short_term_history
        .iter()
        .find(|m| m.role == "system" && m.text.starts_with("[summary of"));
    assert!(
        summary.is_some(),
        "older history should be collapsed into a summary message once the char budget is exceeded, got: {:?}",
        envelope.short_term_history
    );
    assert!(
        envelope.short_term_history.len() < 6,
        "summarization should shrink the history below the uncompressed count"
    );
}

#[tokio::test]
async fn history_compression_flag_disabled_keeps_full_uncompressed_history() {
    let embedder = FakeEmbedder::new();
    let config = test_config();
    assert!(!config.feature_flags.history_compression, "flag defaults to off");
    let h = build_harness(config, embedder, FakeRouter::new(sonnet_medium()));

    let session_id = "session-no-compress";
    for i in 0..6 {
        h.pipeline
            .enrich(EnrichRequest {
                session_id: session_id.to_string(),
                message: format!("msg-{i}-{}", "x".repeat(700)),
                has_attachment: false,
            })
            .await
            .unwrap();
    }

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: session_id.to_string(),
            message: "what did we discuss earlier".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    assert!(
        envelope
            .short_term_history
            .iter()
            .all(|m| !m.text.starts_with("[summary of")),
        "historyCompression=false must never summarize"
    );
}

// --- Scenario 4: ingest then invalidate makes a chunk searchable -----------

#[tokio::test]
async fn scenario_ingest_invalidate_then_search_finds_new_chunk() {
    let query = "what in the world is zymurgy-42";
    let query_vector = vec![0.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let embedder = FakeEmbedder::new().with_fixed(query, query_vector.clone());
    let h = build_harness(test_config(), embedder, FakeRouter::new(sonnet_medium()));

    let before = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-d".to_string(),
            message: query.to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();
    assert!(before.rag_context.is_empty(), "nothing ingested yet");

    h.store
        .upsert_batch(&[chunk(
            "memory",
            "zymurgy-note",
            "zymurgy-42 is the internal codename for the fermentation project",
            query_vector,
        )])
        .unwrap();
    h.index.invalidate();

    let after = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-d-followup".to_string(),
            message: query.to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    assert_eq!(after.rag_context.len(), 1);
    assert!(after.rag_context[0].text.contains("zymurgy-42"));
    assert!(after.rag_context[0].score >= 0.7, "score was {}", after.rag_context[0].score);
}

// --- Scenario 5: route-aware trim restricts sources and topK --------------

#[tokio::test]
async fn scenario_route_aware_trim_restricts_to_memory_for_qwen_local() {
    let query = "quick local question";
    let query_vector = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let embedder = FakeEmbedder::new().with_fixed(query, query_vector.clone());
    let qwen_decision = RouteDecision {
        route: Route::QwenLocal,
        reason: "short local query".to_string(),
        priority: Priority::Low,
        confidence: Confidence::High,
        fallback_chain: vec![Route::Haiku],
    };
    let h = build_harness(test_config(), embedder, FakeRouter::new(qwen_decision));

    h.store
        .upsert_batch(&[
            chunk("memory", "m1", "memory hit one", query_vector.clone()),
            chunk("chat", "c1", "chat hit one", query_vector.clone()),
            chunk("chat_export", "e1", "chat export hit one", query_vector),
        ])
        .unwrap();
    h.index.invalidate();

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-e".to_string(),
            message: query.to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();

    assert_eq!(envelope.route_decision.route, Route::QwenLocal);
    assert!(envelope.rag_context.iter().all(|hit| hit.source == "memory"));
    assert!(envelope.rag_context.len() <= 3);
    assert!(!envelope.rag_context.is_empty());
}

// --- Scenario 6: total embedding-backend outage degrades gracefully -------

#[tokio::test]
async fn scenario_embedding_outage_degrades_gracefully() {
    let embedder = FakeEmbedder::new().always_fails();
    let h = build_harness(test_config(), embedder, FakeRouter::new(sonnet_medium()));

    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-f".to_string(),
            message: "Summarize everything relevant to this project please".to_string(),
            has_attachment: false,
        })
        .await
        .expect("degraded mode still returns Ok, never an error");

    assert!(envelope.rag_context.is_empty());
    assert!(envelope.metadata.degraded);
    assert_eq!(envelope.route_decision.route, Route::Sonnet);
}

// --- P1: determinism -------------------------------------------------------

#[tokio::test]
async fn p1_identical_requests_yield_identical_rag_and_route() {
    let query = "identical request determinism check";
    let vector = vec![0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let embedder = FakeEmbedder::new().with_fixed(query, vector.clone());
    let h = build_harness(test_config(), embedder, FakeRouter::new(sonnet_medium()));

    h.store
        .upsert_batch(&[chunk("memory", "d1", "a deterministic memory chunk", vector)])
        .unwrap();
    h.index.invalidate();

    let a = h
        .pipeline
        .enrich(EnrichRequest { session_id: "session-p1-a".to_string(), message: query.to_string(), has_attachment: false })
        .await
        .unwrap();
    let b = h
        .pipeline
        .enrich(EnrichRequest { session_id: "session-p1-b".to_string(), message: query.to_string(), has_attachment: false })
        .await
        .unwrap();

    assert_eq!(a.rag_context.len(), b.rag_context.len());
    for (x, y) in a.rag_context.iter().zip(b.rag_context.iter()) {
        assert_eq!(x.locator, y.locator);
        assert_eq!(x.score, y.score);
    }
    assert_eq!(a.route_decision.route, b.route_decision.route);
}

// --- P5: content-hash reuse skips re-embedding -----------------------------

#[tokio::test]
async fn p5_reingesting_identical_content_reuses_embedding_without_a_new_call() {
    let h = build_harness(test_config(), FakeEmbedder::new(), FakeRouter::new(sonnet_medium()));

    let text = "a transcript line that gets re-ingested verbatim";
    let hash = enrichment_hub::store::content_hash(text);
    let embedding = vec![0.1f32; DIM];

    h.store
        .upsert_batch(&[Chunk {
            id: 0,
            source: "memory".to_string(),
            locator: "loc-1".to_string(),
            text: text.to_string(),
            embedding: Some(embedding.clone()),
            content_hash: hash.clone(),
            created_at: now_rfc3339(),
        }])
        .unwrap();

    let reused = h.store.find_embedding_by_hash(&hash).unwrap();
    assert_eq!(reused, Some(embedding));
}

// --- P7: deadline is enforced even under slow upstreams --------------------

#[tokio::test(flavor = "multi_thread")]
async fn p7_deadline_exceeded_when_upstreams_are_slower_than_the_budget() {
    let mut config = test_config();
    config.enrichment_deadline_ms = 80;
    let embedder = FakeEmbedder::new().with_delay(Duration::from_millis(500));
    let router = FakeRouter::new(sonnet_medium()).with_delay(Duration::from_millis(500));
    let h = build_harness(config, embedder, router);

    let started = std::time::Instant::now();
    let envelope = h
        .pipeline
        .enrich(EnrichRequest {
            session_id: "session-p7".to_string(),
            message: "this message should blow past the enrichment deadline".to_string(),
            has_attachment: false,
        })
        .await
        .expect("deadline expiry must still return a well-formed envelope, not an error");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(80) && elapsed < Duration::from_millis(130),
        "enrich should return at ~the configured deadline, took {elapsed:?}"
    );
    assert!(envelope.metadata.degraded);
    assert!(!envelope.metadata.skipped);
    assert!(envelope.rag_context.is_empty());
    assert_eq!(envelope.route_decision.route, Route::Sonnet);
}

// --- P9: RAG and routing run in parallel, not sequentially -----------------

#[tokio::test(flavor = "multi_thread")]
async fn p9_rag_and_routing_run_concurrently_under_parallel_execution() {
    let mut config = test_config();
    config.enrichment_deadline_ms = 5000;
    let embedder = FakeEmbedder::new().with_delay(Duration::from_millis(200));
    let router = FakeRouter::new(sonnet_medium()).with_delay(Duration::from_millis(200));
    let h = build_harness(config, embedder, router);

    let started = std::time::Instant::now();
    h.pipeline
        .enrich(EnrichRequest {
            session_id: "session-p9".to_string(),
            message: "a message long enough to avoid the skip heuristics entirely".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Sequential execution would take >= 400ms; parallel fan-out should
    // complete close to the slower of the two branches (~200ms).
    assert!(elapsed < Duration::from_millis(350), "enrich took {elapsed:?}, RAG and routing did not run in parallel");
}

#[tokio::test(flavor = "multi_thread")]
async fn p9_rag_and_routing_run_sequentially_when_parallel_execution_disabled() {
    let mut config = test_config();
    config.enrichment_deadline_ms = 5000;
    config.feature_flags.parallel_execution = false;
    let embedder = FakeEmbedder::new().with_delay(Duration::from_millis(120));
    let router = FakeRouter::new(sonnet_medium()).with_delay(Duration::from_millis(120));
    let h = build_harness(config, embedder, router);

    let started = std::time::Instant::now();
    h.pipeline
        .enrich(EnrichRequest {
            session_id: "session-p9-seq".to_string(),
            message: "another message long enough to avoid the skip heuristics".to_string(),
            has_attachment: false,
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(200), "expected sequential fan-out to take at least both delays, took {elapsed:?}");
}
