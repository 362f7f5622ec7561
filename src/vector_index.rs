use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::SOURCES;
use crate::store::ChunkStore;

/// A loaded, immutable snapshot of the index: a contiguous row-major
/// `n x d` matrix of unit-normalized vectors, a parallel row-to-id array,
/// and a per-source row range so a search can be scoped to a subset
/// without scanning other sources (spec §4.3).
struct Snapshot {
    dimension: usize,
    /// Row-major, `rows.len() == dimension * ids.len()`.
    rows: Vec<f32>,
    ids: Vec<i64>,
    /// `(start_row, end_row)` exclusive, per source name.
    ranges: Vec<(String, (usize, usize))>,
    loaded_at: Instant,
}

impl Snapshot {
    fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Vec::new(),
            ids: Vec::new(),
            ranges: Vec::new(),
            loaded_at: Instant::now(),
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        let start = i * self.dimension;
        &self.rows[start..start + self.dimension]
    }

    fn range_for_sources(&self, sources: &[&str]) -> Vec<(usize, usize)> {
        self.ranges
            .iter()
            .filter(|(name, _)| sources.is_empty() || sources.contains(&name.as_str()))
            .map(|(_, range)| *range)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredId {
    score: f32,
    id: i64,
}

impl Eq for ScoredId {}
impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `BinaryHeap` is a max-heap, and we use it to keep the top-K
        // scores by evicting the "greatest" element whenever the heap
        // grows past K. So "greatest" here must mean "most evictable":
        // lowest score first, and among equal scores, the larger chunk id
        // (so the smaller id survives — matching the ascending-id
        // tie-break rule applied to the final result).
        other
            .score
            .total_cmp(&self.score)
            .then(self.id.cmp(&other.id))
    }
}
impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub loaded: bool,
    pub rows: usize,
    pub bytes: usize,
    pub loaded_at: Option<String>,
    pub per_source_counts: std::collections::HashMap<String, usize>,
    pub degraded: bool,
}

/// In-memory vector index over all chunks. Guarded by an `RwLock` so a
/// reload replaces the snapshot atomically: in-flight searches hold their
/// own `Arc` clone of the old snapshot and are unaffected by a concurrent
/// reload (spec §4.3 "Loading" + §5 "Shared resources").
pub struct VectorIndex {
    dimension: usize,
    stale_window: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    stale: std::sync::atomic::AtomicBool,
    /// Prevents two concurrent reloads from racing (the second load should
    /// observe the first's result rather than duplicate work).
    loading: tokio::sync::Mutex<()>,
    degraded: std::sync::atomic::AtomicBool,
}

impl VectorIndex {
    pub fn new(dimension: usize, stale_window: Duration) -> Self {
        Self {
            dimension,
            stale_window,
            snapshot: RwLock::new(Arc::new(Snapshot::empty(dimension))),
            stale: std::sync::atomic::AtomicBool::new(true),
            loading: tokio::sync::Mutex::new(()),
            degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn invalidate(&self) {
        self.stale.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn needs_reload(&self) -> bool {
        if self.stale.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        let snapshot = self.snapshot.read();
        snapshot.loaded_at.elapsed() > self.stale_window
    }

    /// Reload the snapshot from the Chunk Store. Lazy and idempotent:
    /// concurrent callers serialize on `loading` and the first one's result
    /// is visible to the rest once it releases the lock, so a second caller
    /// that raced in re-checks `needs_reload` and usually finds it already
    /// satisfied.
    async fn ensure_loaded(&self, store: &ChunkStore) {
        if !self.needs_reload() {
            return;
        }
        let _guard = self.loading.lock().await;
        if !self.needs_reload() {
            return;
        }

        match self.load(store) {
            Ok(snapshot) => {
                *self.snapshot.write() = Arc::new(snapshot);
                self.stale.store(false, std::sync::atomic::Ordering::SeqCst);
                self.degraded.store(false, std::sync::atomic::Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(error = %e, "vector index load failed, falling back to linear scan");
                self.degraded.store(true, std::sync::atomic::Ordering::SeqCst);
                // Leave `stale` set so the next search attempts another
                // reload rather than sticking with a failed state forever.
            }
        }
    }

    fn load(&self, store: &ChunkStore) -> Result<Snapshot, crate::error::AppError> {
        let mut rows = Vec::new();
        let mut ids = Vec::new();
        let mut ranges = Vec::new();

        for source in SOURCES {
            let start = ids.len();
            let vectors = store.iterate_all(source)?;
            for (id, vector) in vectors {
                if vector.len() != self.dimension {
                    return Err(crate::error::AppError::MalformedResponse(format!(
                        "chunk {id} has dimension {} but index expects {}",
                        vector.len(),
                        self.dimension
                    )));
                }
                let norm = l2_norm(&vector);
                if norm > 0.0 {
                    rows.extend(vector.iter().map(|v| v / norm));
                } else {
                    rows.extend(vector.iter());
                }
                ids.push(id);
            }
            ranges.push((source.to_string(), (start, ids.len())));
        }

        Ok(Snapshot {
            dimension: self.dimension,
            rows,
            ids,
            ranges,
            loaded_at: Instant::now(),
        })
    }

    /// Top-K cosine similarity search scoped to `sources` (empty = all).
    /// Falls back transparently to a linear scan over the store if the
    /// in-memory snapshot failed to load (degraded mode, spec §4.3).
    pub async fn search(
        &self,
        store: &ChunkStore,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        sources: &[&str],
    ) -> Result<(Vec<(i64, f32)>, bool), crate::error::AppError> {
        self.ensure_loaded(store).await;

        if self.is_degraded() {
            let source = if sources.len() == 1 { Some(sources[0]) } else { None };
            let hits = store.linear_scan(source, query, top_k)?;
            return Ok((
                hits.into_iter().filter(|(_, s)| *s >= min_score).collect(),
                true,
            ));
        }

        let snapshot = self.snapshot.read().clone();
        let norm = l2_norm(query);
        if norm == 0.0 || snapshot.ids.is_empty() {
            return Ok((Vec::new(), false));
        }
        let query_unit: Vec<f32> = query.iter().map(|v| v / norm).collect();

        let ranges = snapshot.range_for_sources(sources);
        let mut heap: BinaryHeap<ScoredId> = BinaryHeap::with_capacity(top_k + 1);

        for (start, end) in ranges {
            for row_idx in start..end {
                let score = dot(&query_unit, snapshot.row(row_idx));
                let id = snapshot.ids[row_idx];
                heap.push(ScoredId { score, id });
                if heap.len() > top_k {
                    heap.pop();
                }
            }
        }

        let mut results: Vec<(i64, f32)> = heap.into_iter().map(|s| (s.id, s.score)).collect();
        // Min-heap pop order is ascending by our custom Ord; we want
        // descending score with ascending-id tie-break, so sort explicitly.
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results.retain(|(_, score)| *score >= min_score);
        Ok((results, false))
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot.read().clone();
        let mut per_source_counts = std::collections::HashMap::new();
        for (name, (start, end)) in &snapshot.ranges {
            per_source_counts.insert(name.clone(), end - start);
        }
        IndexStats {
            loaded: !snapshot.ids.is_empty(),
            rows: snapshot.ids.len(),
            bytes: snapshot.rows.len() * std::mem::size_of::<f32>(),
            loaded_at: if snapshot.ids.is_empty() {
                None
            } else {
                Some(crate::store::now_rfc3339())
            },
            per_source_counts,
            degraded: self.is_degraded(),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_against_empty_store_returns_empty() {
        let store = ChunkStore::open(":memory:").unwrap();
        let index = VectorIndex::new(2, Duration::from_secs(60));
        let (hits, degraded) = index
            .search(&store, &[1.0, 0.0], 5, 0.0, &[])
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert!(!degraded);
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity_with_ascending_id_tiebreak() {
        let store = ChunkStore::open(":memory:").unwrap();
        let chunk = |locator: &str, text: &str, v: Vec<f32>| crate::model::Chunk {
            id: 0,
            source: "memory".to_string(),
            locator: locator.to_string(),
            text: text.to_string(),
            content_hash: crate::store::content_hash(text),
            embedding: Some(v),
            created_at: crate::store::now_rfc3339(),
        };
        store
            .upsert_batch(&[
                chunk("a", "a", vec![1.0, 0.0]),
                chunk("b", "b", vec![1.0, 0.0]),
                chunk("c", "c", vec![0.0, 1.0]),
            ])
            .unwrap();

        let index = VectorIndex::new(2, Duration::from_secs(60));
        index.invalidate();
        let (hits, degraded) = index
            .search(&store, &[1.0, 0.0], 10, 0.0, &[])
            .await
            .unwrap();
        assert!(!degraded);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 2);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert!(hits[2].1 < hits[0].1);
    }

    #[tokio::test]
    async fn min_score_filters_low_scoring_hits() {
        let store = ChunkStore::open(":memory:").unwrap();
        let chunk = |locator: &str, v: Vec<f32>| crate::model::Chunk {
            id: 0,
            source: "memory".to_string(),
            locator: locator.to_string(),
            text: locator.to_string(),
            content_hash: crate::store::content_hash(locator),
            embedding: Some(v),
            created_at: crate::store::now_rfc3339(),
        };
        store
            .upsert_batch(&[chunk("a", vec![1.0, 0.0]), chunk("b", vec![0.0, 1.0])])
            .unwrap();

        let index = VectorIndex::new(2, Duration::from_secs(60));
        index.invalidate();
        let (hits, _) = index
            .search(&store, &[1.0, 0.0], 10, 0.5, &[])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[tokio::test]
    async fn scoping_to_a_source_excludes_other_sources() {
        let store = ChunkStore::open(":memory:").unwrap();
        let chunk = |source: &str, locator: &str, v: Vec<f32>| crate::model::Chunk {
            id: 0,
            source: source.to_string(),
            locator: locator.to_string(),
            text: locator.to_string(),
            content_hash: crate::store::content_hash(&format!("{source}{locator}")),
            embedding: Some(v),
            created_at: crate::store::now_rfc3339(),
        };
        store
            .upsert_batch(&[
                chunk("memory", "a", vec![1.0, 0.0]),
                chunk("chat", "b", vec![1.0, 0.0]),
            ])
            .unwrap();

        let index = VectorIndex::new(2, Duration::from_secs(60));
        index.invalidate();
        let (hits, _) = index
            .search(&store, &[1.0, 0.0], 10, 0.0, &["memory"])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
