//! Multimodal analysis capability used for scanned pages and images.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Value, json};
use thiserror::Error;

use super::rate_limit::TokenBucket;
use crate::config::VisionConfig;

const DEFAULT_IMAGE_PROMPT: &str = "Describe this image for a search index. Transcribe any \
     visible text verbatim, then summarize charts, tables, diagrams and figures.";

const DEFAULT_PAGE_PROMPT: &str = "This is one page of a document. Transcribe all text on the \
     page verbatim, preserving reading order, then describe any figures or tables.";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Vision API rate limit exceeded")]
    RateLimited,

    #[error("Vision request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Vision API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("Vision request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Vision API returned no content")]
    EmptyResponse,

    #[error("Failed to parse vision response: {0}")]
    Parse(String),
}

/// What to analyze.
#[derive(Debug, Clone)]
pub enum VisionInput {
    /// A raster image with its MIME type.
    Image { bytes: Bytes, mime: &'static str },
    /// A single-page PDF; `page` is 1-based and only used for logging.
    PdfPage { bytes: Bytes, page: u32 },
}

impl VisionInput {
    fn default_prompt(&self) -> &'static str {
        match self {
            Self::Image { .. } => DEFAULT_IMAGE_PROMPT,
            Self::PdfPage { .. } => DEFAULT_PAGE_PROMPT,
        }
    }

    fn content_part(&self) -> Value {
        match self {
            Self::Image { bytes, mime } => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{}", STANDARD.encode(bytes)) }
            }),
            Self::PdfPage { bytes, page } => json!({
                "type": "file",
                "file": {
                    "filename": format!("page-{page}.pdf"),
                    "file_data": format!("data:application/pdf;base64,{}", STANDARD.encode(bytes))
                }
            }),
        }
    }
}

/// Turns visual content into text.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    fn model_name(&self) -> &str;

    /// Describe the input. `prompt` is appended to the default instructions.
    async fn describe(&self, input: VisionInput, prompt: Option<&str>)
    -> Result<String, VisionError>;
}

/// Vision over an OpenAI-compatible chat completions endpoint.
///
/// Every call first takes a token from the shared [`TokenBucket`], then runs
/// under the configured timeout. Failures are not retried here.
pub struct OpenAiVisionAnalyzer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    limiter: Arc<TokenBucket>,
}

impl OpenAiVisionAnalyzer {
    pub fn new(config: &VisionConfig, client: reqwest::Client, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            limiter,
        }
    }

    fn build_body(&self, input: &VisionInput, prompt: Option<&str>) -> Value {
        let instructions = match prompt {
            Some(extra) if !extra.trim().is_empty() => {
                format!("{}\n\nAdditional instructions: {}", input.default_prompt(), extra)
            }
            _ => input.default_prompt().to_string(),
        };
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": instructions },
                    input.content_part(),
                ]
            }]
        })
    }

    async fn send(&self, body: Value) -> Result<String, VisionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.client.post(&url).header(CONTENT_TYPE, "application/json");
        let request = match &self.api_key {
            Some(api_key) => request.header(AUTHORIZATION, format!("Bearer {api_key}")),
            None => request,
        };

        let response = request.json(&body).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VisionError::RateLimited);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("(empty body)"));
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(VisionError::Status {
                status: status.as_u16(),
                body: message,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| VisionError::Parse(e.to_string()))?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(VisionError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiVisionAnalyzer {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(skip(self, input, prompt), fields(model = %self.model))]
    async fn describe(
        &self,
        input: VisionInput,
        prompt: Option<&str>,
    ) -> Result<String, VisionError> {
        self.limiter.acquire().await;
        let body = self.build_body(&input, prompt);
        match tokio::time::timeout(self.timeout, self.send(body)).await {
            Ok(result) => result,
            Err(_) => Err(VisionError::Timeout(self.timeout)),
        }
    }
}


#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, header, method, path},
    };

    use super::*;

    fn config(base_url: &str) -> VisionConfig {
        toml::from_str(&format!(
            "base_url = \"{base_url}\"\napi_key = \"sk-test\"\ntimeout_secs = 5"
        ))
        .unwrap()
    }

    fn analyzer(server: &MockServer) -> OpenAiVisionAnalyzer {
        OpenAiVisionAnalyzer::new(
            &config(&server.uri()),
            reqwest::Client::new(),
            Arc::new(TokenBucket::new(10, 10.0)),
        )
    }

    #[tokio::test]
    async fn test_describe_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_string_contains("data:image/png;base64,"))
            .and(body_string_contains("focus on the legend"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "  A bar chart.  " } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = analyzer(&server)
            .describe(
                VisionInput::Image {
                    bytes: Bytes::from_static(b"png"),
                    mime: "image/png",
                },
                Some("focus on the legend"),
            )
            .await
            .unwrap();
        assert_eq!(text, "A bar chart.");
    }

    #[tokio::test]
    async fn test_pdf_page_uses_file_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("data:application/pdf;base64,"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "Page text" } }]
            })))
            .mount(&server)
            .await;

        let text = analyzer(&server)
            .describe(
                VisionInput::PdfPage {
                    bytes: Bytes::from_static(b"%PDF"),
                    page: 2,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(text, "Page text");
    }

    #[tokio::test]
    async fn test_rate_limited_and_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "overloaded" }
            })))
            .mount(&server)
            .await;

        let vision = analyzer(&server);
        let input = VisionInput::Image {
            bytes: Bytes::from_static(b"x"),
            mime: "image/jpeg",
        };
        assert!(matches!(
            vision.describe(input.clone(), None).await,
            Err(VisionError::RateLimited)
        ));
        match vision.describe(input, None).await {
            Err(VisionError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_content_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "" } }]
            })))
            .mount(&server)
            .await;

        let result = analyzer(&server)
            .describe(
                VisionInput::Image {
                    bytes: Bytes::from_static(b"x"),
                    mime: "image/gif",
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(VisionError::EmptyResponse)));
    }
}
