//! Provider rotation against real HTTP backends.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use wiremock::{
    Mock, MockServer,
    matchers::{body_string_contains, method, path},
};

use crate::{
    Grounding,
    config::{GroundingConfig, ProviderModels},
    models::{Document, OwnerScope},
    providers::{
        ChatMessage, CompletionRequest, GatewayProvider, GatewaySettings, GenerationGateway,
        ProviderError,
        open_ai::OpenAiProvider,
        test_utils::{
            SequentialResponder, chat_response, error_response, mount_chat, sse_response,
        },
    },
    services::RetrievalQuery,
};

fn backend(name: &str, server: &MockServer) -> GatewayProvider {
    GatewayProvider::new(
        Arc::new(OpenAiProvider::new(
            name,
            server.uri(),
            Some("sk-test".into()),
            reqwest::Client::new(),
        )),
        ProviderModels {
            chat: format!("{name}-chat"),
            streaming: None,
        },
    )
}

fn gateway(backends: Vec<GatewayProvider>, cooldown: Duration) -> GenerationGateway {
    GenerationGateway::new(
        backends,
        GatewaySettings {
            error_threshold: 3,
            cooldown,
            timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(5),
        },
    )
}

fn question() -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::user("What is in my documents?")])
}

#[tokio::test]
async fn test_rate_limited_provider_rotates_then_recovers() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let a = SequentialResponder::rate_limited();
    let b = SequentialResponder::always(chat_response("from b"));
    mount_chat(&server_a, a.clone()).await;
    mount_chat(&server_b, b.clone()).await;

    let gateway = gateway(
        vec![backend("a", &server_a), backend("b", &server_b)],
        Duration::from_millis(300),
    );

    // Every call lands on B; A is tried until it reaches the threshold.
    for _ in 0..6 {
        let response = gateway.complete(&question()).await.unwrap();
        assert_eq!(response.content, "from b");
        assert_eq!(response.provider, "b");
    }
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.call_count(), 6);
    assert!(gateway.health()[0].cooling_down);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!gateway.health()[0].cooling_down);
    gateway.complete(&question()).await.unwrap();
    assert_eq!(a.call_count(), 4);
}

#[tokio::test]
async fn test_every_provider_failing_is_exhausted() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mount_chat(&server_a, SequentialResponder::rate_limited()).await;
    mount_chat(&server_b, SequentialResponder::always(error_response(500, "boom"))).await;

    let gateway = gateway(
        vec![backend("a", &server_a), backend("b", &server_b)],
        Duration::from_secs(60),
    );
    match gateway.complete(&question()).await.unwrap_err() {
        ProviderError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert_eq!(last.status().map(|s| s.as_u16()), Some(500));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_fails_over_to_healthy_backend() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let a = SequentialResponder::always(error_response(503, "overloaded"));
    mount_chat(&server_a, a.clone()).await;
    mount_chat(&server_b, sse_response(&["Grounded", " answer"])).await;

    let gateway = gateway(
        vec![backend("a", &server_a), backend("b", &server_b)],
        Duration::from_secs(60),
    );
    let fragments: Vec<String> = gateway
        .stream(&question())
        .await
        .unwrap()
        .map(|f| f.unwrap())
        .collect()
        .await;

    assert_eq!(fragments.concat(), "Grounded answer");
    assert_eq!(a.call_count(), 1);
}

#[tokio::test]
async fn test_grounded_answer_carries_retrieved_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("The warranty lasts five years"))
        .respond_with(chat_response("Five years."))
        .expect(1)
        .mount(&server)
        .await;

    let config = GroundingConfig::from_str(&format!(
        r#"
        [embedding]
        dimensions = 64

        [[generation.providers]]
        name = "primary"
        base_url = "{}"
        models.chat = "gpt-4o-mini"
    "#,
        server.uri()
    ))
    .unwrap();
    let grounding = Grounding::from_config(&config).await.unwrap();
    let scope = OwnerScope::new("carol", "support");

    let text = "The warranty lasts five years from the date of purchase.";
    let result = grounding
        .processor
        .ingest(Document::new(text.as_bytes(), "warranty.txt", scope.clone()))
        .await;
    assert!(result.success);

    let retrieval = grounding
        .retrieval
        .retrieve(RetrievalQuery::new(scope, "How long is the warranty?"))
        .await
        .unwrap();
    assert!(!retrieval.is_empty());

    let request = CompletionRequest::grounded(&retrieval.context(), "How long is the warranty?");
    let response = grounding.generation.complete(&request).await.unwrap();
    assert_eq!(response.content, "Five years.");
    assert_eq!(response.provider, "primary");
}
