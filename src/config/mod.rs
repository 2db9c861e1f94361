//! Configuration for the ingestion and retrieval pipeline.
//!
//! The pipeline is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Every section is
//! optional; an empty file yields a working in-memory setup that uses the
//! deterministic embedding fallback.
//!
//! # Example
//!
//! ```toml
//! [embedding]
//! base_url = "https://api.openai.com/v1"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [[generation.providers]]
//! name = "primary"
//! base_url = "https://api.openai.com/v1"
//! api_key = "${OPENAI_API_KEY}"
//! models.chat = "gpt-4o-mini"
//! ```

mod embedding;
mod ingestion;
mod observability;
mod providers;
mod retrieval;
mod storage;

use std::path::Path;

pub use embedding::*;
pub use ingestion::*;
pub use observability::*;
pub use providers::*;
pub use retrieval::*;
use serde::{Deserialize, Serialize};
pub use storage::*;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroundingConfig {
    /// Upload limits, streaming concurrency and extraction mode.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Chunk window size and overlap.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Embedding API and cache.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Multimodal analysis for scanned pages and images.
    /// When omitted, visually dense files fall back to text extraction.
    #[serde(default)]
    pub vision: Option<VisionConfig>,

    /// Similarity thresholds and fallback limits.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Vector storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Completion providers and rotation policy.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GroundingConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GroundingConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingestion.validate()?;
        self.chunking.validate()?;
        self.embedding.validate()?;
        if let Some(vision) = &self.vision {
            vision.validate()?;
        }
        self.retrieval.validate()?;
        #[cfg(feature = "pgvector")]
        if let StorageConfig::Pgvector(pg) = &self.storage {
            pg.validate()?;
        }
        self.generation.validate()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid interpolation pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
