//! Embedding service abstraction
//!
//! Provides a unified interface for embedding providers:
//! - OpenAI-compatible embeddings endpoints (batched, rate limited)
//! - Deterministic feature-hashing embedder for offline runs and tests

use crate::config::{CallPolicy, EmbeddingConfig};
use crate::errors::{AppError, Result};
use crate::resilience::{CallKind, OutboundGuard};
use crate::text::normalize_text;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// Cosine similarity; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// OpenAI embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    batch_size: usize,
    policy: CallPolicy,
    guard: OutboundGuard,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(config: &EmbeddingConfig, guard: OutboundGuard) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "embedding.api_key is required for the openai provider".to_string(),
        })?;
        let dimension = match config.model.as_str() {
            "text-embedding-ada-002" | "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            _ => config.dimension,
        };

        // Per-attempt timeouts are enforced by the guard
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            batch_size: config.batch_size.max(1),
            policy: config.policy.clone(),
            guard,
        })
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&OpenAIRequest {
                input: texts,
                model: &self.model,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message: body,
            });
        }

        let mut result: OpenAIResponse = response.json().await?;
        if result.data.len() != texts.len() {
            return Err(AppError::EmbeddingError {
                message: format!("expected {} embeddings, got {}", texts.len(), result.data.len()),
            });
        }
        result.data.sort_by_key(|e| e.index);
        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for group in texts.chunks(self.batch_size) {
            let embeddings = self
                .guard
                .call(CallKind::Embedding, &self.policy, || self.make_request(group))
                .await?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Texts sharing vocabulary get high cosine similarity. No network access.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let normalized = normalize_text(text);

        for token in normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration. `none` disables embeddings.
pub fn create_embedder(config: &EmbeddingConfig, guard: OutboundGuard) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "openai" => Ok(Some(Arc::new(OpenAIEmbedder::new(config, guard)?))),
        "hashing" => Ok(Some(Arc::new(HashingEmbedder::new(config.dimension)))),
        "none" => Ok(None),
        other => Err(AppError::Configuration {
            message: format!("unknown embedding provider: {}", other),
        }),
    }
}
