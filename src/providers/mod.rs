//! # Completion providers
//!
//! Interchangeable chat-completion backends behind one trait, and the
//! [`GenerationGateway`] that rotates across them.
//!
//! Every backend speaks the same request shape ([`CompletionRequest`]) and
//! reports failures as a [`ProviderError`]. The gateway decides what a
//! failure means for rotation using [`classify_provider_error`].

pub mod fallback;
mod gateway;
pub mod open_ai;
pub mod rotation;
#[cfg(any(test, feature = "provider-test"))]
pub mod test;
#[cfg(test)]
pub(crate) mod test_utils;

use std::{io, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fallback::{FallbackDecision, classify_http_status, classify_provider_error};
pub use gateway::{GatewayProvider, GatewaySettings, GenerationGateway};
pub use rotation::{ProviderHealth, RotationState};

use crate::streaming::IdleTimeoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A provider-agnostic completion request. The model is chosen per provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// A question answered from retrieved context.
    ///
    /// The context goes into a system message ahead of the question. An
    /// empty context yields the bare question.
    pub fn grounded(context: &str, question: impl Into<String>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !context.trim().is_empty() {
            messages.push(ChatMessage::system(format!(
                "Answer using the following document excerpts where relevant.\n\n{context}"
            )));
        }
        messages.push(ChatMessage::user(question));
        Self::new(messages)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    /// Name of the provider that answered.
    pub provider: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Text fragments of a streamed completion, in order.
pub type CompletionStream = BoxStream<'static, Result<String, ProviderError>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("provider returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("no completion providers configured")]
    NoProviders,

    #[error("all {attempts} provider attempts failed; last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<ProviderError>,
    },

    #[error("Internal provider error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Error for a non-2xx response. 429 becomes [`ProviderError::RateLimited`].
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited { message }
        } else {
            Self::Status { status, message }
        }
    }

    /// HTTP status behind the error, when there is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status(),
            _ => None,
        }
    }
}

impl From<io::Error> for ProviderError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut
            && let Some(idle) = err.get_ref().and_then(|e| e.downcast_ref::<IdleTimeoutError>())
        {
            return Self::Timeout(idle.0);
        }
        Self::Stream(err.to_string())
    }
}

/// One completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Start a streamed completion.
    ///
    /// Errors before the first fragment are returned here or as the
    /// stream's first item; both let the gateway fail over.
    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError>;
}
