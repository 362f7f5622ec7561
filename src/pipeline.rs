use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::embedding::EmbedBackend;
use crate::error::AppError;
use crate::model::{
    Confidence, Envelope, EnvelopeMetadata, HistoryMessage, Priority, Route, RouteDecision,
    StageTimings,
};
use crate::routing::RouteClassifier;
use crate::search::{looks_high_stakes, SearchOptions, UnifiedSearch};
use crate::store::ChunkStore;
use crate::vector_index::VectorIndex;

/// Closed vocabulary of short acknowledgements that never warrant enrichment
/// (spec §4.6 step 1).
const SKIP_ACKS: &[&str] = &["ok", "thanks", "yes", "no", "got it", "done", "k", "ty"];
const SKIP_MIN_LENGTH: usize = 20;
const SKIP_REPEAT_WINDOW: Duration = Duration::from_secs(5);

const MAX_RECENT_DECISIONS: usize = 200;

/// History-compression budget (spec §4.6 step 2, off by default): once the
/// short-term history's total text exceeds this many characters, the older
/// messages are summarized down to one message rather than passed verbatim.
/// There is no tokenizer in this service, so the budget is expressed in
/// characters using the common ~4-chars-per-token rule of thumb (~1,000
/// tokens).
const HISTORY_COMPRESSION_CHAR_BUDGET: usize = 4_000;
/// Number of most-recent messages always kept verbatim even when the older
/// portion of history is summarized.
const HISTORY_COMPRESSION_KEEP_RECENT: usize = 4;

/// Per-session rolling history of recent messages, bounded to
/// `short_term_history_len` (default 20). Routing and assembly each read a
/// shorter prefix of this (defaults 3 and 6 respectively, spec §4.6).
struct SessionHistory {
    messages: VecDeque<HistoryMessage>,
    last_message_at: Instant,
}

impl SessionHistory {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            last_message_at: Instant::now() - SKIP_REPEAT_WINDOW - Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct RecentDecision {
    route: Route,
    latency_ms: u64,
    skipped: bool,
    cache_hit: bool,
    degraded: bool,
}

/// Running counters + a bounded ring buffer of recent enrich outcomes,
/// exposed via `GET /stats`.
struct PipelineStats {
    recent: VecDeque<RecentDecision>,
    total_requests: u64,
    total_skipped: u64,
    total_latency_ms: u64,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            recent: VecDeque::with_capacity(MAX_RECENT_DECISIONS),
            total_requests: 0,
            total_skipped: 0,
            total_latency_ms: 0,
        }
    }

    fn record(&mut self, decision: RecentDecision) {
        self.total_requests += 1;
        if decision.skipped {
            self.total_skipped += 1;
        }
        self.total_latency_ms += decision.latency_ms;
        if self.recent.len() == MAX_RECENT_DECISIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(decision);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_skipped: u64,
    pub average_latency_ms: f64,
    pub recent_cache_hit_rate: f64,
    pub recent_degraded_rate: f64,
    pub route_counts: std::collections::HashMap<String, usize>,
}

pub struct EnrichRequest {
    pub session_id: String,
    pub message: String,
    pub has_attachment: bool,
}

/// Everything the Context Pipeline needs to service one `/enrich` call. Owns
/// the session-history map and the stats ring buffer; the rest are shared
/// handles into the other components.
pub struct ContextPipeline {
    config: Arc<AppConfig>,
    embedding_client: Arc<dyn EmbedBackend>,
    routing_client: Arc<dyn RouteClassifier>,
    cache: Arc<crate::search::QueryEmbeddingCache>,
    index: Arc<VectorIndex>,
    store: Arc<ChunkStore>,
    embed_semaphore: Arc<tokio::sync::Semaphore>,
    search: UnifiedSearch,
    sessions: DashMap<String, Mutex<SessionHistory>>,
    stats: Mutex<PipelineStats>,
}

impl ContextPipeline {
    pub fn new(
        config: Arc<AppConfig>,
        embedding_client: Arc<dyn EmbedBackend>,
        routing_client: Arc<dyn RouteClassifier>,
        cache: Arc<crate::search::QueryEmbeddingCache>,
        index: Arc<VectorIndex>,
        store: Arc<ChunkStore>,
        embed_semaphore: Arc<tokio::sync::Semaphore>,
    ) -> Self {
        let search = UnifiedSearch::new(&config);
        Self {
            config,
            embedding_client,
            routing_client,
            cache,
            index,
            store,
            embed_semaphore,
            search,
            sessions: DashMap::new(),
            stats: Mutex::new(PipelineStats::new()),
        }
    }

    /// Full spec §4.6 operation: skip check, parallel RAG+routing fan-out
    /// under a deadline, route validation, envelope assembly.
    pub async fn enrich(&self, request: EnrichRequest) -> Result<Envelope, AppError> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.enrichment_deadline_ms);

        let since_last = self.time_since_last_message(&request.session_id);
        if self.config.feature_flags.skip_logic
            && should_skip(&request.message, request.has_attachment, since_last)
        {
            let envelope = self.build_skip_envelope(&request, started);
            self.append_history(&request);
            self.record_stats(&envelope, started);
            return Ok(envelope);
        }

        let result = tokio::time::timeout(deadline, self.enrich_inner(&request)).await;
        let mut envelope = match result {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(e)) => {
                self.append_history(&request);
                return Err(e);
            }
            Err(_) => {
                // Deadline fired: spec §7/§4.6 require every path to produce
                // an envelope rather than an error escaping the enrichment
                // boundary. Return the best-effort envelope we can assemble
                // with no context and a safe-default route, `degraded: true`
                // (P7).
                tracing::warn!(session_id = %request.session_id, "enrichment deadline exceeded");
                let envelope = self.build_deadline_envelope(&request, started);
                self.append_history(&request);
                self.record_stats(&envelope, started);
                return Ok(envelope);
            }
        };
        envelope.metadata.latency_ms = started.elapsed().as_millis() as u64;

        self.append_history(&request);
        self.record_stats(&envelope, started);
        Ok(envelope)
    }

    async fn enrich_inner(&self, request: &EnrichRequest) -> Result<Envelope, AppError> {
        let routing_history = self.recent_texts(&request.session_id, self.config.routing_history_len);
        let assembly_history = self.recent_messages(&request.session_id, self.config.assembly_history_len);
        let assembly_history = self.maybe_compress_history(assembly_history).await;

        let timing_stats = self.config.feature_flags.timing_stats;
        let search_start = Instant::now();
        let route_start = Instant::now();

        let (search_result, route_result) = if self.config.feature_flags.parallel_execution {
            tokio::join!(
                self.run_search(&request.message, None),
                self.run_routing(&request.message, &routing_history),
            )
        } else {
            let search_result = self.run_search(&request.message, None).await;
            let route_result = self.run_routing(&request.message, &routing_history).await;
            (search_result, route_result)
        };

        // `timingStats` feature flag (spec §4.6): when disabled, per-stage
        // timings are reported as zero rather than measured — the pipeline
        // still runs identically, only the instrumentation is skipped.
        let search_ms = if timing_stats { search_start.elapsed().as_millis() as u64 } else { 0 };
        let route_ms = if timing_stats { route_start.elapsed().as_millis() as u64 } else { 0 };

        let mut degraded = false;

        let route_decision = match route_result {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "routing classifier unavailable, using safe default");
                degraded = true;
                RouteDecision::safe_default(Route::Sonnet, Priority::Medium)
            }
        };
        let route_decision = validate_route(route_decision, &request.message);

        let assemble_start = Instant::now();

        // RAG and routing race independently (spec §4.6 step 4): the RAG
        // branch can't know the route ahead of time, so it always runs
        // unscoped. Once both sides of the rendezvous have resolved, the
        // route-aware trim is applied as a post-fetch step over whatever
        // candidates the unscoped pass already materialized. A failure on
        // either branch degrades into an empty/default result rather than
        // escaping `enrich` as an error: only `InvalidRequest` and
        // `DeadlineExceeded` are allowed past the enrichment boundary.
        let (mut hits, cache_hit, search_degraded) = match search_result {
            Ok(outcome) => (outcome.hits, outcome.cache_hit, outcome.degraded),
            Err(e) => {
                tracing::warn!(error = %e, "unified search unavailable, proceeding with empty context");
                (Vec::new(), false, true)
            }
        };
        degraded = degraded || search_degraded;

        if self.config.feature_flags.route_aware_sources {
            hits = crate::search::apply_route_trim(hits, route_decision.route);
        } else {
            hits.truncate(self.config.top_k);
        }

        let index_chunk_count = self.store.chunk_count(None).unwrap_or(0);
        let assemble_ms = if timing_stats { assemble_start.elapsed().as_millis() as u64 } else { 0 };
        let rag_count = hits.len();

        Ok(Envelope {
            rag_context: hits,
            route_decision,
            short_term_history: assembly_history,
            system_notes: Vec::new(),
            metadata: EnvelopeMetadata {
                enriched_at: crate::store::now_rfc3339(),
                latency_ms: 0, // overwritten by `enrich` once the full call (including the deadline wrapper) completes
                stage_timings: StageTimings {
                    embed: 0,
                    search: search_ms,
                    route: route_ms,
                    assemble: assemble_ms,
                },
                skipped: false,
                cache_hit,
                degraded,
                rag_count,
                index_chunk_count,
            },
        })
    }

    /// Standalone search, independent of the full enrich pipeline — used by
    /// `GET /search` for callers that only want RAG hits without routing or
    /// skip-check semantics.
    pub async fn search_only(
        &self,
        query: &str,
        top_k: usize,
        sources: &[&str],
        route_hint: Option<Route>,
    ) -> Result<crate::search::SearchOutcome, AppError> {
        self.search
            .search(
                &self.config,
                &self.embedding_client,
                &self.cache,
                &self.index,
                &self.store,
                &self.embed_semaphore,
                query,
                SearchOptions {
                    top_k,
                    sources,
                    route_hint,
                },
            )
            .await
    }

    async fn run_search(
        &self,
        query: &str,
        route_hint: Option<Route>,
    ) -> Result<crate::search::SearchOutcome, AppError> {
        self.search
            .search(
                &self.config,
                &self.embedding_client,
                &self.cache,
                &self.index,
                &self.store,
                &self.embed_semaphore,
                query,
                SearchOptions {
                    top_k: 0,
                    sources: &[],
                    route_hint,
                },
            )
            .await
    }

    async fn run_routing(
        &self,
        message: &str,
        recent_history: &[String],
    ) -> Result<RouteDecision, AppError> {
        self.routing_client.classify(message, recent_history).await
    }

    fn build_skip_envelope(&self, request: &EnrichRequest, started: Instant) -> Envelope {
        let history = self.recent_messages(&request.session_id, self.config.assembly_history_len);
        Envelope {
            rag_context: Vec::new(),
            route_decision: RouteDecision::safe_default(Route::Haiku, Priority::Low),
            short_term_history: history,
            system_notes: vec!["enrichment skipped".to_string()],
            metadata: EnvelopeMetadata {
                enriched_at: crate::store::now_rfc3339(),
                latency_ms: started.elapsed().as_millis() as u64,
                stage_timings: StageTimings::default(),
                skipped: true,
                cache_hit: false,
                degraded: false,
                rag_count: 0,
                index_chunk_count: self.store.chunk_count(None).unwrap_or(0),
            },
        }
    }

    /// Best-effort envelope returned when the overall enrichment deadline
    /// fires (spec §7 `DeadlineExceeded`, §4.6 Contract, P7): empty RAG, a
    /// safe-default route, `degraded: true`. Never an error across the
    /// `/enrich` boundary.
    fn build_deadline_envelope(&self, request: &EnrichRequest, started: Instant) -> Envelope {
        let history = self.recent_messages(&request.session_id, self.config.assembly_history_len);
        Envelope {
            rag_context: Vec::new(),
            route_decision: RouteDecision::safe_default(Route::Sonnet, Priority::Medium),
            short_term_history: history,
            system_notes: vec!["enrichment deadline exceeded".to_string()],
            metadata: EnvelopeMetadata {
                enriched_at: crate::store::now_rfc3339(),
                latency_ms: started.elapsed().as_millis() as u64,
                stage_timings: StageTimings::default(),
                skipped: false,
                cache_hit: false,
                degraded: true,
                rag_count: 0,
                index_chunk_count: self.store.chunk_count(None).unwrap_or(0),
            },
        }
    }

    fn time_since_last_message(&self, session_id: &str) -> Option<Duration> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.lock().last_message_at.elapsed())
    }

    fn append_history(&self, request: &EnrichRequest) {
        let mut entry = self
            .sessions
            .entry(request.session_id.clone())
            .or_insert_with(|| Mutex::new(SessionHistory::new()));
        let mut history = entry.lock();
        history.last_message_at = Instant::now();
        history.messages.push_back(HistoryMessage {
            role: "user".to_string(),
            text: request.message.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        });
        while history.messages.len() > self.config.short_term_history_len {
            history.messages.pop_front();
        }
    }

    fn recent_messages(&self, session_id: &str, limit: usize) -> Vec<HistoryMessage> {
        match self.sessions.get(session_id) {
            Some(entry) => {
                let history = entry.lock();
                history
                    .messages
                    .iter()
                    .rev()
                    .take(limit)
                    .rev()
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    fn recent_texts(&self, session_id: &str, limit: usize) -> Vec<String> {
        self.recent_messages(session_id, limit)
            .into_iter()
            .map(|m| format!("[{}]: {}", m.role, m.text))
            .collect()
    }

    /// History compression (spec §4.6 step 2, `historyCompression` feature
    /// flag, off by default): always dedup consecutive messages with
    /// identical text, and when disabled this is the only thing it does. If
    /// enabled and the remaining history still exceeds the char budget, the
    /// older portion (everything but the last
    /// `HISTORY_COMPRESSION_KEEP_RECENT` messages) is collapsed into one
    /// summary message via a single call to the routing classifier backend.
    /// A failed summarization call degrades to returning the
    /// deduped-but-uncompressed history rather than dropping history or
    /// failing the request.
    async fn maybe_compress_history(&self, messages: Vec<HistoryMessage>) -> Vec<HistoryMessage> {
        if !self.config.feature_flags.history_compression {
            return messages;
        }

        let deduped = dedupe_consecutive_identical(messages);

        let total_chars: usize = deduped.iter().map(|m| m.text.len()).sum();
        if total_chars <= HISTORY_COMPRESSION_CHAR_BUDGET || deduped.len() <= HISTORY_COMPRESSION_KEEP_RECENT {
            return deduped;
        }

        let split_at = deduped.len() - HISTORY_COMPRESSION_KEEP_RECENT;
        let (older, recent) = deduped.split_at(split_at);
        let older_texts: Vec<String> = older.iter().map(|m| format!("[{}]: {}", m.role, m.text)).collect();

        match self.routing_client.summarize(&older_texts).await {
            Ok(summary) if !summary.is_empty() => {
                let summary_message = HistoryMessage {
                    role: "system".to_string(),
                    text: format!("[summary of {} earlier messages] {summary}", older.len()),
                    ts: older.first().map(|m| m.ts).unwrap_or(0),
                };
                let mut out = Vec::with_capacity(recent.len() + 1);
                out.push(summary_message);
                out.extend_from_slice(recent);
                out
            }
            Ok(_) => deduped,
            Err(e) => {
                tracing::warn!(error = %e, "history summarization failed, falling back to uncompressed history");
                deduped
            }
        }
    }

    fn record_stats(&self, envelope: &Envelope, started: Instant) {
        let mut stats = self.stats.lock();
        stats.record(RecentDecision {
            route: envelope.route_decision.route,
            latency_ms: started.elapsed().as_millis() as u64,
            skipped: envelope.metadata.skipped,
            cache_hit: envelope.metadata.cache_hit,
            degraded: envelope.metadata.degraded,
        });
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let stats = self.stats.lock();
        let recent_count = stats.recent.len().max(1) as f64;
        let cache_hits = stats.recent.iter().filter(|d| d.cache_hit).count() as f64;
        let degraded = stats.recent.iter().filter(|d| d.degraded).count() as f64;

        let mut route_counts = std::collections::HashMap::new();
        for decision in &stats.recent {
            *route_counts.entry(decision.route.as_str().to_string()).or_insert(0) += 1;
        }

        StatsSnapshot {
            total_requests: stats.total_requests,
            total_skipped: stats.total_skipped,
            average_latency_ms: if stats.total_requests == 0 {
                0.0
            } else {
                stats.total_latency_ms as f64 / stats.total_requests as f64
            },
            recent_cache_hit_rate: cache_hits / recent_count,
            recent_degraded_rate: degraded / recent_count,
            route_counts,
        }
    }
}

/// Spec §4.6 step 1: a message skips enrichment entirely if it's short, a
/// closed-vocabulary acknowledgement, a system-injected message, carries a
/// media attachment, or arrives within `SKIP_REPEAT_WINDOW` of the previous
/// message in the same session.
fn should_skip(message: &str, has_attachment: bool, since_last: Option<Duration>) -> bool {
    let trimmed = message.trim();
    if trimmed.chars().count() < SKIP_MIN_LENGTH {
        return true;
    }
    if SKIP_ACKS.contains(&trimmed.to_lowercase().as_str()) {
        return true;
    }
    if trimmed.starts_with("System:") {
        return true;
    }
    if has_attachment {
        return true;
    }
    if since_last.is_some_and(|gap| gap < SKIP_REPEAT_WINDOW) {
        return true;
    }
    false
}

/// Spec §4.6 step 3: a low-confidence classification on a high-stakes
/// message is collapsed to the safe default rather than trusted as-is.
fn validate_route(decision: RouteDecision, message: &str) -> RouteDecision {
    if decision.confidence == Confidence::Low && looks_high_stakes(message) {
        return RouteDecision::safe_default(Route::Sonnet, Priority::High);
    }
    crate::search::validate_route_decision(decision)
}

/// Spec §4.6 step 2: drop consecutive history messages that share identical
/// text, keeping the first occurrence of each run.
fn dedupe_consecutive_identical(messages: Vec<HistoryMessage>) -> Vec<HistoryMessage> {
    let mut out: Vec<HistoryMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        if out.last().is_some_and(|prev| prev.text == message.text) {
            continue;
        }
        out.push(message);
    }
    out
}
