use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{Instrument, info_span, instrument};
use uuid::Uuid;

use super::chunker::ChunkDraft;
use crate::{
    cache::{
        EmbeddingError, EmbeddingService,
        vector_store::{VectorBackend, VectorStoreError},
    },
    models::{Chunk, OwnerScope},
};

/// Why a single chunk was not stored.
#[derive(Debug, Error)]
pub enum ChunkWriteError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store failed: {0}")]
    Store(#[from] VectorStoreError),
}

/// Embeds and stores one chunk at a time.
///
/// Failures are per chunk; callers count them and move on.
#[derive(Clone)]
pub struct ChunkWriter {
    embeddings: Arc<EmbeddingService>,
    store: Arc<dyn VectorBackend>,
}

impl ChunkWriter {
    pub fn new(embeddings: Arc<EmbeddingService>, store: Arc<dyn VectorBackend>) -> Self {
        Self { embeddings, store }
    }

    #[instrument(skip(self, scope, draft), fields(chunk_index = draft.index))]
    pub async fn write(
        &self,
        scope: &OwnerScope,
        filename: &str,
        draft: ChunkDraft,
    ) -> Result<Uuid, ChunkWriteError> {
        let embed_span = info_span!("generate_embedding", content_len = draft.content.len());
        let embedding = self
            .embeddings
            .embed(&draft.content)
            .instrument(embed_span)
            .await?;

        let mut metadata = draft.metadata;
        metadata.insert("embedding_source".into(), embedding.source.as_str().into());
        metadata.insert("embedding_model".into(), self.embeddings.model().into());

        let chunk = Chunk {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            filename: filename.to_string(),
            content: draft.content,
            embedding: embedding.vector,
            metadata,
            created_at: Utc::now(),
        };
        let id = chunk.id;

        let store_span = info_span!("store_chunk", chunk_id = %id);
        self.store.insert(chunk).instrument(store_span).await?;
        Ok(id)
    }
}

impl std::fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("embeddings", &self.embeddings)
            .field("dimensions", &self.store.dimensions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::{
        cache::vector_store::InMemoryVectorStore,
        config::EmbeddingConfig,
    };

    fn embeddings(dimensions: usize) -> Arc<EmbeddingService> {
        let config = EmbeddingConfig {
            dimensions,
            ..Default::default()
        };
        Arc::new(EmbeddingService::new(&config, reqwest::Client::new()))
    }

    fn draft(content: &str) -> ChunkDraft {
        ChunkDraft {
            index: 0,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_write_tags_embedding_source() {
        let store = Arc::new(InMemoryVectorStore::new(8));
        let writer = ChunkWriter::new(embeddings(8), store.clone());
        let scope = OwnerScope::new("u", "c");

        writer.write(&scope, "a.txt", draft("hello there")).await.unwrap();

        let rows = store.recent(&scope, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata["embedding_source"], "fallback");
        assert_eq!(rows[0].metadata["embedding_model"], "text-embedding-3-small");
        assert_eq!(rows[0].filename, "a.txt");
    }

    #[tokio::test]
    async fn test_store_dimension_mismatch_is_chunk_error() {
        let store = Arc::new(InMemoryVectorStore::new(4));
        let writer = ChunkWriter::new(embeddings(8), store.clone());

        let err = writer
            .write(&OwnerScope::new("u", "c"), "a.txt", draft("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChunkWriteError::Store(VectorStoreError::DimensionMismatch { .. })
        ));
        assert!(store.is_empty());
    }
}
