//! Embedding gateway.
//!
//! Wraps an OpenAI-compatible `/embeddings` endpoint with an in-process
//! cache and a deterministic fallback. Ingestion never blocks on the API:
//! when credentials are absent or the call fails, a pseudo-embedding derived
//! from SHA-256 of the text is returned instead and tagged as
//! [`EmbeddingSource::Fallback`] so stored chunks can be audited later.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::memory::{CacheStats, EmbeddingCache};
use crate::config::EmbeddingConfig;

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse embedding response: {0}")]
    ParseError(String),

    #[error("No embeddings returned from provider")]
    EmptyResponse,

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Where a vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    /// The embedding API (possibly served from cache).
    Api,
    /// The hash-derived pseudo-embedding. Not semantic.
    Fallback,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f64>,
    pub source: EmbeddingSource,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: EmbeddingVector,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingVector {
    Float(Vec<f64>),
    Base64(String),
}

/// Service for generating text embeddings.
pub struct EmbeddingService {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    timeout: Duration,
    cache: EmbeddingCache,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig, http_client: Client) -> Self {
        Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: Duration::from_secs(config.timeout_secs),
            cache: EmbeddingCache::new(
                config.cache_max_entries,
                Duration::from_secs(config.cache_ttl_secs),
            ),
        }
    }

    /// Embed `text`.
    ///
    /// Only a vector of the wrong length is an error; API failures degrade
    /// to the fallback vector.
    #[tracing::instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let key = self.cache_key(text);
        if let Some(vector) = self.cache.get(&key) {
            debug!(stage = "embedding_cache_hit", "Embedding served from cache");
            return Ok(Embedding {
                vector: vector.as_ref().clone(),
                source: EmbeddingSource::Api,
            });
        }

        let Some(api_key) = self.api_key.as_deref() else {
            debug!(
                stage = "embedding_fallback",
                reason = "no_credentials",
                "Using fallback embedding"
            );
            return Ok(self.fallback(text));
        };

        match self.request(api_key, text).await {
            Ok(vector) => {
                if vector.len() != self.dimensions {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: self.dimensions,
                        actual: vector.len(),
                    });
                }
                self.cache.insert(key, vector.clone());
                Ok(Embedding {
                    vector,
                    source: EmbeddingSource::Api,
                })
            }
            Err(e) => {
                warn!(
                    stage = "embedding_fallback",
                    error = %e,
                    "Embedding API failed, using fallback embedding"
                );
                Ok(self.fallback(text))
            }
        }
    }

    async fn request(&self, api_key: &str, text: &str) -> Result<Vec<f64>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let send = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("(empty body)"));
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(EmbeddingError::Status { status, message });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ParseError(e.to_string()))?;
        let data = parsed
            .data
            .into_iter()
            .next()
            .ok_or(EmbeddingError::EmptyResponse)?;

        match data.embedding {
            EmbeddingVector::Float(vec) => Ok(vec),
            EmbeddingVector::Base64(b64) => decode_base64_vector(&b64),
        }
    }

    /// Deterministic pseudo-embedding: SHA-256 in counter mode, mapped to
    /// [-1, 1] and L2-normalized.
    pub fn fallback(&self, text: &str) -> Embedding {
        Embedding {
            vector: fallback_vector(text, self.dimensions),
            source: EmbeddingSource::Fallback,
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the configured embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("has_credentials", &self.api_key.is_some())
            .finish()
    }
}

fn decode_base64_vector(b64: &str) -> Result<Vec<f64>, EmbeddingError> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
        .map_err(|e| EmbeddingError::ParseError(format!("Invalid base64: {e}")))?;

    // Little-endian f32 values
    if bytes.len() % 4 != 0 {
        return Err(EmbeddingError::ParseError(
            "Invalid base64 embedding length".to_string(),
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64)
        .collect())
}

fn fallback_vector(text: &str, dimensions: usize) -> Vec<f64> {
    let mut values = Vec::with_capacity(dimensions);
    let mut counter: u32 = 0;
    while values.len() < dimensions {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        for word in digest.chunks_exact(4) {
            if values.len() == dimensions {
                break;
            }
            let n = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            values.push(n as f64 / u32::MAX as f64 * 2.0 - 1.0);
        }
        counter = counter.wrapping_add(1);
    }

    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
