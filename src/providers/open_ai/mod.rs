use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ProviderConfig,
    providers::{
        ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
        ProviderError, Usage,
    },
    streaming::{SseBuffer, SseEvent},
};

/// Any backend speaking the OpenAI chat completions protocol.
pub struct OpenAiProvider {
    name: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatCompletionPayload<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn from_config(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self::new(&config.name, &config.base_url, config.api_key.clone(), client)
    }

    /// Build a request with the auth header, if any.
    fn build_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.header(AUTHORIZATION, format!("Bearer {api_key}")),
            None => request,
        }
    }

    async fn post_chat(
        &self,
        model: &str,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let payload = ChatCompletionPayload {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| ProviderError::Internal(format!("failed to encode request: {e}")))?;

        let response = self
            .build_request(self.client.post(format!("{}/chat/completions", self.base_url)))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Self::check_response(response).await
    }

    /// Check response status and extract the error message on failure.
    ///
    /// Errors arrive as `{"error": {"message": "...", "type": "...", "code": "..."}}`.
    async fn check_response(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("(empty body)"));

        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(String::from))
            .unwrap_or(body);

        Err(ProviderError::from_status(status, message))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(
        skip(self, request),
        fields(provider = %self.name, operation = "chat_completion", stream = false)
    )]
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.post_chat(model, request, false).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;

        Ok(CompletionResponse {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            model: completion.model.unwrap_or_else(|| model.to_string()),
            provider: self.name.clone(),
            finish_reason: choice.finish_reason,
            usage: completion.usage,
        })
    }

    #[tracing::instrument(
        skip(self, request),
        fields(provider = %self.name, operation = "chat_completion", stream = true)
    )]
    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let response = self.post_chat(model, request, true).await?;
        Ok(content_fragments(response.bytes_stream()))
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Extract `choices[0].delta.content` from one streamed chunk.
fn delta_content(data: &str) -> Result<Option<String>, ProviderError> {
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::Stream(format!("malformed stream chunk: {e}")))?;
    if let Some(message) = chunk["error"]["message"].as_str() {
        return Err(ProviderError::Stream(message.to_string()));
    }
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from))
}

struct FragmentState<S> {
    body: S,
    buffer: SseBuffer,
    ready: std::collections::VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

/// Decode an SSE body into content fragments, stopping at `[DONE]`.
fn content_fragments<S>(body: S) -> CompletionStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = FragmentState {
        body: body.boxed(),
        buffer: SseBuffer::new(),
        ready: Default::default(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state: FragmentState<BoxStream<'static, _>>| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            let events = match state.body.next().await {
                Some(Ok(bytes)) => state.buffer.push(&bytes),
                Some(Err(e)) => {
                    state.finished = true;
                    state.ready.push_back(Err(ProviderError::Stream(e.to_string())));
                    continue;
                }
                None => {
                    state.finished = true;
                    state.buffer.finish().into_iter().collect()
                }
            };
            for event in events {
                match event {
                    SseEvent::Data(data) => match delta_content(&data) {
                        Ok(Some(text)) => state.ready.push_back(Ok(text)),
                        Ok(None) => {}
                        Err(e) => {
                            state.ready.push_back(Err(e));
                            state.finished = true;
                            break;
                        }
                    },
                    SseEvent::Done => {
                        state.finished = true;
                        break;
                    }
                }
            }
        }
    })
    .boxed()
}
