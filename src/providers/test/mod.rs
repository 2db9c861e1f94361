//! In-process completion provider with configurable failure modes.
//!
//! Used to exercise the gateway's rotation without a network. The reply
//! echoes the last user message; streaming splits it into words.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use http::StatusCode;

use crate::providers::{
    CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream, ProviderError,
    Role, Usage,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub enum TestFailureMode {
    /// Normal operation.
    #[default]
    None,
    /// Every call fails with this status.
    HttpError { status: u16, message: Option<String> },
    /// Every call fails before reaching a server.
    ConnectionError { message: String },
    /// Sleep, then fail as a timeout.
    Timeout { delay: Duration },
    /// Succeed `success_count` times, then fail with `failure_status`.
    FailAfterN { success_count: u32, failure_status: u16 },
    /// Streams break after emitting `fragments` words. Plain completions succeed.
    StreamInterrupt { fragments: usize },
}

pub struct TestProvider {
    name: String,
    failure_mode: TestFailureMode,
    request_count: AtomicU32,
}

impl TestProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_failure_mode(name, TestFailureMode::None)
    }

    pub fn with_failure_mode(name: impl Into<String>, failure_mode: TestFailureMode) -> Self {
        Self {
            name: name.into(),
            failure_mode,
            request_count: AtomicU32::new(0),
        }
    }

    /// Calls received so far, successful or not.
    pub fn call_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    async fn apply_failure_mode(&self) -> Result<(), ProviderError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        match &self.failure_mode {
            TestFailureMode::None | TestFailureMode::StreamInterrupt { .. } => Ok(()),
            TestFailureMode::HttpError { status, message } => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| format!("Test provider error: {status}"));
                Err(ProviderError::from_status(status_code(*status), message))
            }
            TestFailureMode::ConnectionError { message } => Err(ProviderError::Internal(
                format!("Connection error: {message}"),
            )),
            TestFailureMode::Timeout { delay } => {
                tokio::time::sleep(*delay).await;
                Err(ProviderError::Timeout(*delay))
            }
            TestFailureMode::FailAfterN {
                success_count,
                failure_status,
            } => {
                if count >= *success_count {
                    Err(ProviderError::from_status(
                        status_code(*failure_status),
                        format!("FailAfterN triggered (request {} of {success_count})", count + 1),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn reply_to(request: &CompletionRequest) -> String {
    let question = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str());
    format!("Echo: {question}")
}

#[async_trait]
impl CompletionProvider for TestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.apply_failure_mode().await?;
        let content = reply_to(request);
        let words = content.split_whitespace().count() as u32;
        Ok(CompletionResponse {
            content,
            model: model.to_string(),
            provider: self.name.clone(),
            finish_reason: Some("stop".into()),
            usage: Some(Usage {
                prompt_tokens: 0,
                completion_tokens: words,
                total_tokens: words,
            }),
        })
    }

    async fn stream(
        &self,
        _model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        self.apply_failure_mode().await?;
        let reply = reply_to(request);
        let mut items: Vec<Result<String, ProviderError>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        if let TestFailureMode::StreamInterrupt { fragments } = self.failure_mode {
            items.truncate(fragments);
            items.push(Err(ProviderError::Stream("connection reset".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hello there")])
    }

    #[tokio::test]
    async fn test_echoes_last_user_message() {
        let provider = TestProvider::new("t");
        let response = provider.complete("m", &request()).await.unwrap();
        assert_eq!(response.content, "Echo: hello there");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_after_n() {
        let provider = TestProvider::with_failure_mode(
            "t",
            TestFailureMode::FailAfterN {
                success_count: 1,
                failure_status: 503,
            },
        );
        assert!(provider.complete("m", &request()).await.is_ok());
        let err = provider.complete("m", &request()).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_stream_interrupt_after_fragments() {
        let provider =
            TestProvider::with_failure_mode("t", TestFailureMode::StreamInterrupt { fragments: 1 });
        let items: Vec<_> = provider.stream("m", &request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Echo: ");
        assert!(items[1].is_err());
    }
}
