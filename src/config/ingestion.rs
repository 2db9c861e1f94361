use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::extraction::ExtractionMode;

/// Upload handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestionConfig {
    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Minimum extracted characters for a document to be accepted.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Simultaneous embed+store calls while streaming page-by-page.
    #[serde(default = "default_stream_concurrency")]
    pub stream_concurrency: usize,

    /// Ingest page-by-page when the primary extractor can stream.
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Extraction depth used when the caller does not choose one.
    #[serde(default)]
    pub default_mode: ExtractionMode,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            min_content_chars: default_min_content_chars(),
            stream_concurrency: default_stream_concurrency(),
            streaming: true,
            default_mode: ExtractionMode::default(),
        }
    }
}

impl IngestionConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_concurrency == 0 {
            return Err(ConfigError::Validation(
                "ingestion.stream_concurrency must be at least 1".into(),
            ));
        }
        if self.max_file_size_bytes == 0 {
            return Err(ConfigError::Validation(
                "ingestion.max_file_size_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_min_content_chars() -> usize {
    10
}

fn default_stream_concurrency() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// Chunk window configuration, in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "chunking.chunk_size must be positive".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::Validation(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}
