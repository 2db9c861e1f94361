use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Similarity search and fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Threshold used when the caller does not supply one.
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,

    /// The single relaxed threshold tried after an empty search.
    #[serde(default = "default_floor_threshold")]
    pub floor_threshold: f64,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Chunks returned by the recent-chunks fallback.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    /// Similarity reported for fallback rows that were not scored.
    #[serde(default = "default_neutral_similarity")]
    pub neutral_similarity: f64,

    /// Upper bound on the all-chunks fallback.
    #[serde(default = "default_all_chunks_cap")]
    pub all_chunks_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            floor_threshold: default_floor_threshold(),
            default_limit: default_limit(),
            recent_limit: default_recent_limit(),
            neutral_similarity: default_neutral_similarity(),
            all_chunks_cap: default_all_chunks_cap(),
        }
    }
}

impl RetrievalConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("default_threshold", self.default_threshold),
            ("floor_threshold", self.floor_threshold),
            ("neutral_similarity", self.neutral_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "retrieval.{name} must be within 0..=1, got {value}"
                )));
            }
        }
        if self.floor_threshold > self.default_threshold {
            return Err(ConfigError::Validation(format!(
                "retrieval.floor_threshold ({}) must not exceed retrieval.default_threshold ({})",
                self.floor_threshold, self.default_threshold
            )));
        }
        if self.default_limit == 0 || self.all_chunks_cap == 0 {
            return Err(ConfigError::Validation(
                "retrieval.default_limit and retrieval.all_chunks_cap must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_threshold() -> f64 {
    0.7
}

fn default_floor_threshold() -> f64 {
    0.3
}

fn default_limit() -> usize {
    5
}

fn default_recent_limit() -> usize {
    10
}

fn default_neutral_similarity() -> f64 {
    0.5
}

fn default_all_chunks_cap() -> usize {
    200
}
