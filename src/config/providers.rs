use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Multi-provider generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// Ordered provider list. Rotation starts at the first entry.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Consecutive errors after which a provider is skipped.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Time since last use after which a skipped provider is eligible again.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Per-call timeout for non-streaming completions.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum silence between streamed fragments. Zero disables the check.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            error_threshold: default_error_threshold(),
            cooldown_secs: default_cooldown_secs(),
            timeout_secs: default_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::Validation(
                "generation.error_threshold must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::Validation(
                    "generation.providers entries need a name".into(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

fn default_error_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}

/// One OpenAI-compatible completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default = "super::embedding::default_openai_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    pub models: ProviderModels,
}

/// Model name per completion mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderModels {
    /// Model for non-streaming calls.
    pub chat: String,

    /// Model for streaming calls. Defaults to `chat`.
    #[serde(default)]
    pub streaming: Option<String>,
}

impl ProviderModels {
    pub fn for_mode(&self, streaming: bool) -> &str {
        if streaming {
            self.streaming.as_deref().unwrap_or(&self.chat)
        } else {
            &self.chat
        }
    }
}
