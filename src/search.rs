use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::embedding::EmbedBackend;
use crate::error::AppError;
use crate::model::{Confidence, RagHit, Route};
use crate::store::ChunkStore;
use crate::vector_index::VectorIndex;

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// Bounded LRU keyed by canonicalized query, with a time-to-live on top of
/// the size bound (spec §4.4 step 2, §5, §9). Insertion order is tracked
/// separately from the map so eviction is O(1) amortized without pulling in
/// an external LRU crate — mirrors the teacher's preference for small
/// hand-rolled structures behind `parking_lot` over reaching for a new
/// dependency for a narrow need.
pub struct QueryEmbeddingCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    order: Mutex<std::collections::VecDeque<String>>,
}

impl QueryEmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Canonicalize a query for cache keying: lowercase, trim, collapse
    /// internal whitespace runs to a single space.
    pub fn canonicalize(query: &str) -> String {
        query
            .trim()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn get(&self, canonical_key: &str) -> Option<Vec<f32>> {
        let mut entries = self.entries.lock();
        match entries.get(canonical_key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.vector.clone()),
            Some(_) => {
                entries.remove(canonical_key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, canonical_key: String, vector: Vec<f32>) {
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();

        if !entries.contains_key(&canonical_key) {
            order.push_back(canonical_key.clone());
        }
        entries.insert(
            canonical_key,
            CacheEntry {
                vector,
                inserted_at: Instant::now(),
            },
        );

        while entries.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// One row of the route-aware trim table (spec §4.4 step 7): which sources
/// a route may see, and how aggressively to cap topK/minScore for it.
struct TrimRule {
    sources: &'static [&'static str],
    top_k: usize,
    min_score_floor: f32,
}

fn trim_rule_for(route: Route) -> TrimRule {
    match route {
        Route::Opus | Route::Sonnet | Route::ReasoningLocal => TrimRule {
            sources: &["memory", "chat", "chat_export"],
            top_k: 10,
            min_score_floor: 0.3,
        },
        Route::Haiku => TrimRule {
            sources: &["memory", "chat"],
            top_k: 5,
            min_score_floor: 0.4,
        },
        Route::QwenLocal => TrimRule {
            sources: &["memory"],
            top_k: 3,
            min_score_floor: 0.5,
        },
    }
}

pub struct SearchOptions<'a> {
    pub top_k: usize,
    pub sources: &'a [&'a str],
    pub route_hint: Option<Route>,
}

pub struct SearchOutcome {
    pub hits: Vec<RagHit>,
    pub cache_hit: bool,
    pub degraded: bool,
}

pub struct UnifiedSearch {
    config_top_k: usize,
    overfetch: usize,
}

impl UnifiedSearch {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            config_top_k: config.top_k,
            overfetch: config.overfetch,
        }
    }

    /// Spec §4.4 full operation: canonicalize → cache lookup → embed on miss
    /// → vector search with overfetch → materialize → dedup by content hash
    /// → route-aware trim → final topK.
    pub async fn search(
        &self,
        config: &AppConfig,
        embedding_client: &dyn EmbedBackend,
        cache: &QueryEmbeddingCache,
        index: &VectorIndex,
        store: &ChunkStore,
        embed_semaphore: &tokio::sync::Semaphore,
        query: &str,
        options: SearchOptions<'_>,
    ) -> Result<SearchOutcome, AppError> {
        let canonical = QueryEmbeddingCache::canonicalize(query);

        // `embeddingCache` feature flag (spec §4.6): when disabled, the
        // query-embedding LRU is bypassed entirely — every query re-embeds,
        // never reads from or writes to the cache.
        let (vector, cache_hit) = if !config.feature_flags.embedding_cache {
            let _permit = embed_semaphore.acquire().await.expect("semaphore open");
            (embedding_client.embed(query).await?, false)
        } else {
            match cache.get(&canonical) {
                Some(v) => (v, true),
                None => {
                    // Query-path embeds share the same admission-control gate
                    // as ingest (spec §5): a burst of enrich calls must not
                    // stampede the embedding backend any more than a large
                    // ingest batch.
                    let _permit = embed_semaphore.acquire().await.expect("semaphore open");
                    let v = embedding_client.embed(query).await?;
                    cache.put(canonical, v.clone());
                    (v, false)
                }
            }
        };

        let top_k = if options.top_k == 0 {
            self.config_top_k
        } else {
            options.top_k
        };
        let overfetch_k = top_k * self.overfetch.max(1);

        let min_score = options
            .sources
            .iter()
            .map(|s| config.min_score_for(s))
            .fold(f32::MAX, f32::min);
        let min_score = if min_score == f32::MAX { 0.0 } else { min_score };

        // `vectorIndex` feature flag (spec §4.6): when disabled, the
        // in-memory matrix is bypassed entirely and every search goes
        // straight to the store's linear scan — the same code path the
        // index itself falls back to when a load fails, just chosen here by
        // configuration rather than by failure.
        let (scored_ids, degraded) = if config.feature_flags.vector_index {
            index
                .search(store, &vector, overfetch_k, min_score, options.sources)
                .await?
        } else {
            let single_source = if options.sources.len() == 1 {
                Some(options.sources[0])
            } else {
                None
            };
            let hits = store.linear_scan(single_source, &vector, overfetch_k)?;
            (
                hits.into_iter().filter(|(_, s)| *s >= min_score).collect(),
                false,
            )
        };

        let ids: Vec<i64> = scored_ids.iter().map(|(id, _)| *id).collect();
        let chunks = store.read_by_ids(&ids)?;
        let score_by_id: HashMap<i64, f32> = scored_ids.into_iter().collect();

        let mut hits: Vec<RagHit> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let score = *score_by_id.get(&chunk.id)?;
                if score < config.min_score_for(&chunk.source) {
                    return None;
                }
                Some((chunk, score))
            })
            .map(|(chunk, score)| RagHit {
                source: chunk.source,
                locator: chunk.locator,
                text: chunk.text,
                score,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        let hits = dedupe_by_text_keep_highest_score(hits);

        let hits = if let Some(route) = options.route_hint {
            apply_route_trim(hits, route)
        } else {
            hits.into_iter().take(top_k).collect()
        };

        Ok(SearchOutcome {
            hits,
            cache_hit,
            degraded,
        })
    }
}

/// Deduplicate hits that share the same underlying text (a proxy for
/// `content_hash` equality at this layer, since `RagHit` does not carry the
/// hash itself), keeping the higher score (spec §4.4 step 6).
fn dedupe_by_text_keep_highest_score(hits: Vec<RagHit>) -> Vec<RagHit> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<RagHit> = Vec::with_capacity(hits.len());
    for hit in hits {
        if let Some(&idx) = seen.get(&hit.text) {
            if hit.score > out[idx].score {
                out[idx] = hit;
            }
        } else {
            seen.insert(hit.text.clone(), out.len());
            out.push(hit);
        }
    }
    out
}

/// Post-fetch route-aware trim (spec §4.4 step 7, §4.6 step 5): restricts an
/// already-materialized hit set to the sources/topK/minScore a route is
/// allowed to see. Exposed to the pipeline so the rendezvous step can apply
/// it once the route is known, without re-querying the index.
pub(crate) fn apply_route_trim(hits: Vec<RagHit>, route: Route) -> Vec<RagHit> {
    let rule = trim_rule_for(route);
    hits.into_iter()
        .filter(|hit| rule.sources.contains(&hit.source.as_str()))
        .filter(|hit| hit.score >= rule.min_score_floor)
        .take(rule.top_k)
        .collect()
}

/// Heuristic used by the pipeline to decide whether a low-confidence route
/// classification should be overridden given high-stakes keywords (spec
/// §4.6 step 3).
pub fn looks_high_stakes(message: &str) -> bool {
    const KEYWORDS: &[&str] = &["security", "production", "architect"];
    let lower = message.to_lowercase();
    KEYWORDS.iter().any(|kw| lower.contains(kw))
}

pub fn validate_route_decision(
    mut decision: crate::model::RouteDecision,
) -> crate::model::RouteDecision {
    if decision.confidence == Confidence::Low && decision.reason.is_empty() {
        decision.reason = "low confidence".to_string();
    }
    decision
}
