//! Wiremock helpers for OpenAI-compatible completion backends.
//!
//! ```ignore
//! let server = MockServer::start().await;
//! let responder =
//!     SequentialResponder::new(vec![error_response(429, "slow down"), chat_response("ok")]);
//! mount_chat(&server, responder.clone()).await;
//! // ...
//! assert_eq!(responder.call_count(), 2);
//! ```
#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
};

use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// A successful non-streaming chat completion.
pub fn chat_response(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/json")
        .set_body_json(json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "model": "mock-model",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }))
}

/// An error response in the OpenAI error envelope.
pub fn error_response(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .insert_header("content-type", "application/json")
        .set_body_json(json!({
            "error": {"message": message, "type": "test_error", "code": status}
        }))
}

/// SSE body for the given content fragments, terminated by `[DONE]`.
pub fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    let role = json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]});
    body.push_str(&format!("data: {role}\n\n"));
    for fragment in fragments {
        let chunk = json!({"choices": [{"index": 0, "delta": {"content": fragment}}]});
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn sse_response(fragments: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse_body(fragments))
}

/// Mount `responder` on `POST /chat/completions`.
pub async fn mount_chat(server: &MockServer, responder: impl wiremock::Respond + 'static) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(responder)
        .mount(server)
        .await;
}

struct SequentialResponderState {
    responses: Vec<ResponseTemplate>,
    call_count: AtomicUsize,
}

/// Returns its responses in order, then repeats the last one.
///
/// Clones share the call counter, so a clone can be mounted and the
/// original inspected afterwards.
#[derive(Clone)]
pub struct SequentialResponder {
    state: Arc<SequentialResponderState>,
}

impl SequentialResponder {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        assert!(
            !responses.is_empty(),
            "SequentialResponder requires at least one response"
        );
        Self {
            state: Arc::new(SequentialResponderState {
                responses,
                call_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn always(response: ResponseTemplate) -> Self {
        Self::new(vec![response])
    }

    pub fn rate_limited() -> Self {
        Self::always(error_response(429, "Rate limit reached for requests"))
    }

    pub fn call_count(&self) -> usize {
        self.state.call_count.load(AtomicOrdering::SeqCst)
    }
}

impl wiremock::Respond for SequentialResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let count = self.state.call_count.fetch_add(1, AtomicOrdering::SeqCst);
        let idx = count.min(self.state.responses.len() - 1);
        self.state.responses[idx].clone()
    }
}
