//! Ingest-then-retrieve flows through a pipeline built from TOML.

use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use crate::{
    Grounding,
    cache::EmbeddingSource,
    config::GroundingConfig,
    error::ErrorCategory,
    models::{Document, OwnerScope},
    services::{RetrievalQuery, RetrievalTier},
};

const DIMS: usize = 256;

async fn pipeline() -> Grounding {
    pipeline_from(&format!(
        r#"
        [embedding]
        dimensions = {DIMS}

        [chunking]
        chunk_size = 200
        chunk_overlap = 20
    "#
    ))
    .await
}

async fn pipeline_from(toml: &str) -> Grounding {
    let config = GroundingConfig::from_str(toml).unwrap();
    Grounding::from_config(&config).await.unwrap()
}

fn alice() -> OwnerScope {
    OwnerScope::new("alice", "conv-1")
}

#[tokio::test]
async fn test_ingest_then_retrieve_round_trip() {
    let grounding = pipeline().await;
    let text = "The mitochondria is the powerhouse of the cell and produces ATP.";
    let result = grounding
        .processor
        .ingest(Document::new(text.as_bytes(), "biology.txt", alice()))
        .await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.chunk_count, 1);

    let stored = grounding.store.all(&alice(), 10).await.unwrap();
    let retrieval = grounding
        .retrieval
        .retrieve(RetrievalQuery::new(alice(), stored[0].content.clone()))
        .await
        .unwrap();

    assert_eq!(retrieval.tier, RetrievalTier::Similarity);
    assert_eq!(retrieval.attempts, 1);
    assert_eq!(retrieval.results.len(), 1);
    assert!(retrieval.results[0].similarity > 0.99);
    assert_eq!(retrieval.results[0].chunk.filename, "biology.txt");
    assert_eq!(retrieval.context(), stored[0].content);
}

#[tokio::test]
async fn test_retrieval_never_crosses_scopes() {
    let grounding = pipeline().await;
    let bob = OwnerScope::new("bob", "conv-1");
    let other_conversation = OwnerScope::new("alice", "conv-2");

    let secret = "Alice keeps her launch codes in the blue notebook.";
    let result = grounding
        .processor
        .ingest(Document::new(secret.as_bytes(), "secret.txt", alice()))
        .await;
    assert!(result.success);

    for scope in [bob, other_conversation] {
        let retrieval = grounding
            .retrieval
            .retrieve(RetrievalQuery::new(scope, secret))
            .await
            .unwrap();
        assert!(retrieval.is_empty());
        assert_eq!(retrieval.tier, RetrievalTier::All);
    }
}

#[tokio::test]
async fn test_unmatched_query_falls_back_to_recent_chunks() {
    let grounding = pipeline().await;
    for (name, text) in [
        ("first.txt", "Notes about the quarterly budget review meeting."),
        ("second.txt", "Minutes from the engineering planning session."),
    ] {
        let result = grounding
            .processor
            .ingest(Document::new(text.as_bytes(), name, alice()))
            .await;
        assert!(result.success);
    }

    let retrieval = grounding
        .retrieval
        .retrieve(RetrievalQuery::new(alice(), "zebra migration patterns"))
        .await
        .unwrap();

    assert_eq!(retrieval.tier, RetrievalTier::Recent);
    assert_eq!(retrieval.attempts, 3);
    assert_eq!(retrieval.results.len(), 2);
    assert!(retrieval.results.iter().all(|r| r.similarity == 0.5));
    assert!(retrieval.context().contains("[Document: "));
}

#[tokio::test]
async fn test_chemistry_file_yields_one_chunk_per_molecule() {
    let grounding = pipeline().await;
    let water = "\
Water
  test

  3  2  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
    0.9600    0.0000    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
   -0.2400    0.9300    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0  0  0  0
  1  3  1  0  0  0  0
M  END
";
    let sdf = format!("{water}$$$$\n{water}$$$$\n");
    let result = grounding
        .processor
        .ingest(Document::new(sdf.into_bytes(), "molecules.sdf", alice()))
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.chunk_count, 2);
    let rows = grounding.store.all(&alice(), 10).await.unwrap();
    assert!(rows.iter().all(|r| r.content.contains("H2O")));
}

#[tokio::test]
async fn test_rejected_uploads_store_nothing() {
    let grounding = pipeline().await;

    let empty = grounding
        .processor
        .process(Document::new(Vec::<u8>::new(), "empty.txt", alice()))
        .await
        .unwrap_err();
    assert_eq!(empty.error_category, ErrorCategory::EmptyContent);

    let unsupported = grounding
        .processor
        .process(Document::new(&b"MZ\x90\x00"[..], "tool.exe", alice()))
        .await
        .unwrap_err();
    assert_eq!(unsupported.error_category, ErrorCategory::UnsupportedFormat);

    let too_short = grounding
        .processor
        .ingest(Document::new(&b"   hi   "[..], "tiny.txt", alice()))
        .await;
    assert!(!too_short.success);
    assert_eq!(too_short.chunk_count, 0);

    assert!(grounding.store.all(&alice(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_api_embeddings_used_when_configured() {
    let server = MockServer::start().await;
    let vector: Vec<f64> = (0..8).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect();
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": vector}],
            "model": "text-embedding-3-small"
        })))
        .mount(&server)
        .await;

    let grounding = pipeline_from(&format!(
        r#"
        [embedding]
        base_url = "{}"
        api_key = "sk-test"
        dimensions = 8
    "#,
        server.uri()
    ))
    .await;

    let result = grounding
        .processor
        .ingest(Document::new(
            "Embeddings come from the configured API.".as_bytes(),
            "api.txt",
            alice(),
        ))
        .await;
    assert!(result.success, "{:?}", result.errors);

    let retrieval = grounding
        .retrieval
        .retrieve(RetrievalQuery::new(alice(), "anything at all"))
        .await
        .unwrap();
    assert_eq!(retrieval.embedding_source, Some(EmbeddingSource::Api));
    assert_eq!(retrieval.tier, RetrievalTier::Similarity);
    assert_eq!(grounding.embeddings.cache_stats().entries, 2);
}
