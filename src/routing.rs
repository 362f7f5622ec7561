use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::error::AppError;
use crate::model::{Confidence, Priority, Route, RouteDecision};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe seam over the routing-classifier backend (spec §4.6, §6).
/// Production code wires in `RoutingClient`; tests substitute an in-process
/// fake so the RAG/routing rendezvous can be exercised under injected
/// latency and failure without a real local model server.
#[async_trait]
pub trait RouteClassifier: Send + Sync {
    async fn classify(
        &self,
        message: &str,
        recent_history: &[String],
    ) -> Result<RouteDecision, AppError>;

    /// Summarize a run of older short-term-history messages into one
    /// sentence, used by history compression (spec §4.6 step 2: "summarize
    /// older messages by one call to the local classifier model"). Shares
    /// the same backend as `classify` since both are calls to the one local
    /// routing-classifier model.
    async fn summarize(&self, messages: &[String]) -> Result<String, AppError>;
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Free-form JSON the classifier is asked to emit, before lenient
/// extraction is applied.
#[derive(Deserialize)]
struct ClassifierPayload {
    route: Option<String>,
    reason: Option<String>,
    priority: Option<String>,
}

/// Client for the local routing-classifier language model (spec §6).
pub struct RoutingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl RoutingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("routing http client");
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl RouteClassifier for RoutingClient {
    /// Classify a message (with recent history for context) into a route
    /// decision. Unknown or low-confidence-on-high-stakes classifications
    /// are collapsed to a safe default by the caller (see
    /// `pipeline::validate_route`); this client only parses what the
    /// classifier actually said.
    async fn classify(
        &self,
        message: &str,
        recent_history: &[String],
    ) -> Result<RouteDecision, AppError> {
        let prompt = build_router_prompt(message, recent_history);

        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "routing classifier returned status {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::MalformedResponse(e.to_string()))?;

        parse_classifier_reply(&parsed.response)
    }

    /// One `/api/generate` call asking the same local model to compress a
    /// run of older history messages into a single summary sentence.
    async fn summarize(&self, messages: &[String]) -> Result<String, AppError> {
        if messages.is_empty() {
            return Ok(String::new());
        }
        let prompt = format!(
            "Summarize the following conversation excerpt in one or two \
             sentences, preserving names, decisions, and facts that later \
             messages might refer back to:\n\n{}",
            messages.join("\n")
        );

        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "routing classifier returned status {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::MalformedResponse(e.to_string()))?;

        Ok(parsed.response.trim().to_string())
    }
}

/// The classifier's body is expected to carry a JSON object but may be
/// wrapped in commentary. Extract the first balanced `{...}` substring and
/// parse leniently, per spec's design notes open question: preserve
/// `reason`/`priority` verbatim when present, collapse any non-enum
/// `route` (or a payload we can't find at all) to the safe default.
fn parse_classifier_reply(text: &str) -> Result<RouteDecision, AppError> {
    let Some(object) = first_json_object(text) else {
        return Ok(RouteDecision::safe_default(Route::Sonnet, Priority::Medium));
    };

    let payload: ClassifierPayload = match serde_json::from_str(&object) {
        Ok(p) => p,
        Err(_) => return Ok(RouteDecision::safe_default(Route::Sonnet, Priority::Medium)),
    };

    let route = payload
        .route
        .as_deref()
        .and_then(Route::parse)
        .unwrap_or(Route::Sonnet);

    let priority = match payload.priority.as_deref() {
        Some("low") => Priority::Low,
        Some("high") => Priority::High,
        _ => Priority::Medium,
    };

    Ok(RouteDecision {
        route,
        reason: payload.reason.unwrap_or_else(|| "default".to_string()),
        priority,
        confidence: Confidence::Medium,
        fallback_chain: vec![Route::Sonnet, Route::Haiku],
    })
}

static BRACE_SCAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{").unwrap());

/// Find the first balanced `{...}` substring in free text by bracket
/// counting from the first `{`. Returns `None` if no balanced object
/// exists.
fn first_json_object(text: &str) -> Option<String> {
    let start = BRACE_SCAN.find(text)?.start();
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn build_router_prompt(message: &str, recent_history: &[String]) -> String {
    let history = if recent_history.is_empty() {
        "(none)".to_string()
    } else {
        recent_history.join("\n")
    };
    format!(
        "You are a routing classifier. Choose exactly one route from \
         {{opus, sonnet, haiku, qwen_local, reasoning_local}} for the \
         message below, given the recent conversation history. Respond \
         with a JSON object: {{\"route\": ..., \"reason\": ..., \
         \"priority\": \"low\"|\"medium\"|\"high\"}}.\n\n\
         Recent history:\n{history}\n\nMessage:\n{message}"
    )
}
