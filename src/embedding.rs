use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Object-safe seam over the embedding backend (spec §4.1). Production code
/// wires in `EmbeddingClient`; tests substitute an in-process fake so P1-P9
/// and the §8 scenarios can be driven without a real upstream.
#[async_trait]
pub trait EmbedBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// Embedding backend request/response contract (spec §6): `POST /api/embed`
/// with `{model, input}`, `input` a string or array of strings; response
/// `{embeddings: [[float...]...]}`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INPUT_CHARS: usize = 1500;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: EmbedInput<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbedInput<'a> {
    One(&'a str),
    Many(Vec<&'a str>),
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// A thin client to a locally running embedding service. One persistent
/// `reqwest::Client` is reused for connection pooling across calls.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("embedding http client");
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl EmbedBackend for EmbeddingClient {
    /// Embed a single text (used for queries: batch size 1).
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut out = self.embed_batch(std::slice::from_ref(&text)).await?;
        out.pop()
            .ok_or_else(|| AppError::MalformedResponse("empty embeddings array".to_string()))
    }

    /// Embed a batch of texts (used for ingest: batch size 10 by caller
    /// convention). Truncates each input to the embedding window before
    /// submission and retries once on transport error.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        let truncated: Vec<&str> = texts.iter().map(|t| truncate_chars(t, MAX_INPUT_CHARS)).collect();
        let input = if truncated.len() == 1 {
            EmbedInput::One(truncated[0])
        } else {
            EmbedInput::Many(truncated)
        };

        let body = EmbedRequest {
            model: &self.model,
            input,
        };

        let url = format!("{}/api/embed", self.base_url);

        let response = match self.post(&url, &body).await {
            Ok(r) => r,
            Err(_) => self.post(&url, &body).await?, // single retry on transport error
        };

        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "embedding backend returned status {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::MalformedResponse(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(AppError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                return Err(AppError::MalformedResponse(format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }

        Ok(parsed.embeddings)
    }
}

impl EmbeddingClient {
    async fn post(
        &self,
        url: &str,
        body: &EmbedRequest<'_>,
    ) -> Result<reqwest::Response, AppError> {
        self.http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        let s = "héllo wörld";
        let truncated = truncate_chars(s, 3);
        assert_eq!(truncated, "hél");
    }

    #[test]
    fn truncate_chars_noop_when_short() {
        let s = "short";
        assert_eq!(truncate_chars(s, 100), "short");
    }
}
