use serde::{Deserialize, Serialize};

/// A unit of retrievable text, as stored in the Chunk Store and indexed by
/// the Vector Index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub source: String,
    pub locator: String,
    pub text: String,
    /// `None` until an embedding has been computed and attached; per
    /// invariant I3 a chunk with no embedding is invisible to search.
    pub embedding: Option<Vec<f32>>,
    pub content_hash: String,
    pub created_at: String,
}

impl Chunk {
    pub fn is_searchable(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// Serialize an embedding vector as little-endian 32-bit floats, per
/// invariant I1 (`len(embedding_blob) = dimension * 4`).
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// The closed vocabulary of downstream model tiers a request can be routed
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Opus,
    Sonnet,
    Haiku,
    QwenLocal,
    ReasoningLocal,
}

impl Route {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opus" => Some(Route::Opus),
            "sonnet" => Some(Route::Sonnet),
            "haiku" => Some(Route::Haiku),
            "qwen_local" | "qwen-local" | "qwenlocal" => Some(Route::QwenLocal),
            "reasoning_local" | "reasoning-local" | "reasoninglocal" => Some(Route::ReasoningLocal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Opus => "opus",
            Route::Sonnet => "sonnet",
            Route::Haiku => "haiku",
            Route::QwenLocal => "qwen_local",
            Route::ReasoningLocal => "reasoning_local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: String,
    pub priority: Priority,
    pub confidence: Confidence,
    /// Routes that could be tried if the primary route's backend is
    /// unavailable, ordered strongest to weakest fallback.
    pub fallback_chain: Vec<Route>,
}

impl RouteDecision {
    pub fn safe_default(route: Route, priority: Priority) -> Self {
        Self {
            route,
            reason: "default".to_string(),
            priority,
            confidence: Confidence::Low,
            fallback_chain: vec![Route::Sonnet, Route::Haiku],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    pub source: String,
    pub locator: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub text: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StageTimings {
    pub embed: u64,
    pub search: u64,
    pub route: u64,
    pub assemble: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeMetadata {
    pub enriched_at: String,
    pub latency_ms: u64,
    pub stage_timings: StageTimings,
    pub skipped: bool,
    pub cache_hit: bool,
    pub degraded: bool,
    pub rag_count: usize,
    pub index_chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub rag_context: Vec<RagHit>,
    pub route_decision: RouteDecision,
    pub short_term_history: Vec<HistoryMessage>,
    pub system_notes: Vec<String>,
    pub metadata: EnvelopeMetadata,
}
