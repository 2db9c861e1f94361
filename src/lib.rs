//! Grounding: resilient document ingestion and retrieval for conversations.
//!
//! Uploaded documents are routed by extension to an extraction strategy,
//! validated, chunked, embedded and stored per (user, conversation) scope.
//! Queries run a similarity search with bounded threshold relaxation and
//! recency fallbacks. A multi-provider façade load-balances completion
//! calls with error-aware rotation.
//!
//! The main entry points are [`services::DocumentProcessor`],
//! [`services::RetrievalService`] and [`providers::GenerationGateway`].
//! [`Grounding::from_config`] wires all three from a [`config::GroundingConfig`].

pub mod cache;
pub mod config;
pub mod error;
pub mod extraction;
pub mod fallback;
pub mod models;
pub mod observability;
pub mod providers;
pub mod services;
pub mod streaming;
pub mod validation;

#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

pub use error::{ErrorCategory, ErrorType, ProcessingError};

use crate::{
    cache::{
        EmbeddingService,
        vector_store::{InMemoryVectorStore, VectorBackend},
    },
    config::{ConfigError, GroundingConfig, StorageConfig},
    extraction::{FormatRouter, SmartExtractor, TokenBucket, vision::OpenAiVisionAnalyzer},
    providers::GenerationGateway,
    services::{DocumentProcessor, RetrievalService},
};

/// Fully wired pipeline built from one configuration.
pub struct Grounding {
    pub processor: Arc<DocumentProcessor>,
    pub retrieval: Arc<RetrievalService>,
    pub generation: Arc<GenerationGateway>,
    pub store: Arc<dyn VectorBackend>,
    pub embeddings: Arc<EmbeddingService>,
}

impl Grounding {
    /// Build every service from configuration.
    ///
    /// A single `reqwest::Client` is shared by the embedding, vision and
    /// completion backends. The pgvector backend is initialized (extension,
    /// table and index) before it is returned.
    pub async fn from_config(config: &GroundingConfig) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))?;

        let embeddings = Arc::new(EmbeddingService::new(&config.embedding, http_client.clone()));

        let store: Arc<dyn VectorBackend> = match &config.storage {
            StorageConfig::Memory => {
                Arc::new(InMemoryVectorStore::new(config.embedding.dimensions))
            }
            #[cfg(feature = "pgvector")]
            StorageConfig::Pgvector(pg) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(pg.max_connections)
                    .connect(&pg.url)
                    .await
                    .map_err(|e| ConfigError::Validation(format!("pgvector connect: {e}")))?;
                let store = cache::vector_store::PgvectorStore::new(
                    pool,
                    pg.table_name.clone(),
                    config.embedding.dimensions,
                );
                store
                    .initialize()
                    .await
                    .map_err(|e| ConfigError::Validation(format!("pgvector init: {e}")))?;
                Arc::new(store)
            }
        };

        let vision = config.vision.as_ref().map(|vision| {
            let limiter = Arc::new(TokenBucket::per_minute(
                vision.requests_per_minute,
                vision.burst,
            ));
            Arc::new(OpenAiVisionAnalyzer::new(vision, http_client.clone(), limiter))
                as Arc<dyn extraction::VisionAnalyzer>
        });

        let router = Arc::new(FormatRouter::fallback_chain());
        let scanned_threshold = config
            .vision
            .as_ref()
            .map(|v| v.scanned_chars_per_page)
            .unwrap_or(crate::config::DEFAULT_SCANNED_CHARS_PER_PAGE);
        let primary = Arc::new(SmartExtractor::new(vision, scanned_threshold));

        let processor = Arc::new(DocumentProcessor::new(
            config.ingestion.clone(),
            config.chunking.clone(),
            primary,
            router,
            embeddings.clone(),
            store.clone(),
        ));
        let retrieval = Arc::new(RetrievalService::new(
            embeddings.clone(),
            store.clone(),
            config.retrieval.clone(),
        ));
        let generation = Arc::new(GenerationGateway::from_config(
            &config.generation,
            http_client,
        )?);

        Ok(Self {
            processor,
            retrieval,
            generation,
            store,
            embeddings,
        })
    }
}
