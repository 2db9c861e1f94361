use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Average extracted characters per page below which a PDF is treated as scanned.
pub const DEFAULT_SCANNED_CHARS_PER_PAGE: usize = 100;

/// Embedding API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible API (the `/embeddings` path is appended).
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// API key. When absent, every embedding uses the deterministic fallback.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector length every stored chunk must have.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            timeout_secs: default_embedding_timeout(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl EmbeddingConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions == 0 {
            return Err(ConfigError::Validation(
                "embedding.dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub(super) fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    1536
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    3600
}

/// Multimodal analysis configuration for scanned pages and images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisionConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_vision_model")]
    pub model: String,

    /// Per-call timeout; vision calls are short and rate-limited.
    #[serde(default = "default_vision_timeout")]
    pub timeout_secs: u64,

    /// Sustained request rate shared by every vision call.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Requests allowed back-to-back before the rate applies.
    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_scanned_chars_per_page")]
    pub scanned_chars_per_page: usize,

    #[serde(default = "default_vision_max_tokens")]
    pub max_tokens: u32,
}

impl VisionConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_minute == 0 || self.burst == 0 {
            return Err(ConfigError::Validation(
                "vision.requests_per_minute and vision.burst must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_timeout() -> u64 {
    30
}

fn default_requests_per_minute() -> u32 {
    20
}

fn default_burst() -> u32 {
    3
}

fn default_scanned_chars_per_page() -> usize {
    DEFAULT_SCANNED_CHARS_PER_PAGE
}

fn default_vision_max_tokens() -> u32 {
    1024
}
