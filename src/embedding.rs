//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`OpenAiProvider`]** — calls an OpenAI-compatible embeddings API
//!   with batching, retry, and backoff.
//! - **[`DeterministicProvider`]** — seeded token-hashing provider for
//!   tests and offline development; no network access.
//!
//! Also provides vector utilities:
//! - [`validate_vector`] — rejects wrong length, NaN, and infinite values
//! - [`cosine_similarity`] — similarity in `[-1, 1]`, failing on
//!   mismatched dimensions
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhausted retries surface as a recoverable [`MeshError::EmbeddingFailed`];
//! a structurally invalid response body is non-recoverable.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{MeshError, Result};

/// Identity of the backing embedding model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub dimensions: usize,
}

/// Trait for embedding backends.
///
/// Implementations must preserve input order in [`embed_batch`](EmbeddingProvider::embed_batch)
/// and return exactly one vector per input text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model name and dimensionality.
    fn model_info(&self) -> ModelInfo;
}

/// Check that a vector has the expected length and contains only finite
/// components.
pub fn validate_vector(vector: &[f32], dims: usize) -> bool {
    vector.len() == dims && vector.iter().all(|v| v.is_finite())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for zero-magnitude vectors.
///
/// # Errors
///
/// [`MeshError::DimensionMismatch`] if the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(MeshError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return Ok(0.0);
    }

    Ok((dot / denom).clamp(-1.0, 1.0))
}

// ============ OpenAI-compatible provider ============

/// Embedding provider backed by an OpenAI-compatible HTTP API.
///
/// Calls `POST {api_base}/v1/embeddings` with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    api_base: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider from configuration.
    ///
    /// Fails fast if the API key is missing so the misconfiguration shows
    /// up at startup instead of on the first query.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(MeshError::embedding_fatal(
                "OPENAI_API_KEY environment variable not set",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MeshError::embedding_fatal(format!("http client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn call_api(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| MeshError::embedding_fatal("OPENAI_API_KEY not set"))?;

        let url = format!("{}/v1/embeddings", self.api_base);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<MeshError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            MeshError::embedding_fatal(format!("invalid response body: {e}"))
                        })?;
                        let vectors = parse_embeddings_response(&json)?;
                        return self.check_batch(texts.len(), vectors);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(MeshError::embedding(format!(
                            "provider returned {status}: {text}"
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let text = response.text().await.unwrap_or_default();
                    return Err(MeshError::embedding_fatal(format!(
                        "provider returned {status}: {text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(MeshError::embedding(format!("request failed: {e}")));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| MeshError::embedding("embedding failed after retries")))
    }

    /// Enforce the batch contract: one valid vector per input, in order.
    fn check_batch(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected {
            return Err(MeshError::embedding_fatal(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                expected
            )));
        }
        for v in &vectors {
            if !validate_vector(v, self.dims) {
                return Err(MeshError::embedding_fatal(format!(
                    "provider returned a malformed vector (len {}, expected {})",
                    v.len(),
                    self.dims
                )));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.call_api(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MeshError::embedding_fatal("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.call_api(texts).await
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            dimensions: self.dims,
        }
    }
}

/// Parse an OpenAI-style embeddings response: `{ "data": [{ "index": n,
/// "embedding": [...] }, ...] }`. Results are ordered by `index` so the
/// output matches the input order even if the provider reorders entries.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| MeshError::embedding_fatal("response missing data array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| MeshError::embedding_fatal("response entry missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Deterministic provider ============

/// Token-hashing embedding provider for tests and offline development.
///
/// Each whitespace token is hashed into a bucket of the output vector,
/// then the vector is L2-normalized. Texts sharing tokens get a higher
/// cosine similarity, which is enough for exercising the retrieval
/// pipeline without a network provider.
pub struct DeterministicProvider {
    dims: usize,
}

impl DeterministicProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dims;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "deterministic".to_string(),
            dimensions: self.dims,
        }
    }
}

/// Create the appropriate [`EmbeddingProvider`] from configuration.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "deterministic" => Ok(Box::new(DeterministicProvider::new(config.dims))),
        other => Err(MeshError::embedding_fatal(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}
