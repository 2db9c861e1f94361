//! Vector storage for embedded chunks.
//!
//! Every operation is scoped by an [`OwnerScope`]; backends must never
//! return a row stored under a different (user, conversation) pair.

mod memory;
#[cfg(feature = "pgvector")]
mod pgvector;

use async_trait::async_trait;
pub use memory::InMemoryVectorStore;
#[cfg(feature = "pgvector")]
pub use pgvector::PgvectorStore;
use thiserror::Error;

use crate::models::{Chunk, OwnerScope, SearchResult, StoredChunk};

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("Vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Vector store error: {0}")]
    Internal(String),
}

pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Vector length every stored chunk must have.
    fn dimensions(&self) -> usize;

    /// Persist one chunk atomically.
    async fn insert(&self, chunk: Chunk) -> VectorStoreResult<()>;

    /// Chunks in `scope` with similarity of at least `threshold`, best first.
    async fn search(
        &self,
        embedding: &[f64],
        scope: &OwnerScope,
        threshold: f64,
        limit: usize,
    ) -> VectorStoreResult<Vec<SearchResult>>;

    /// The `limit` newest chunks in `scope`.
    async fn recent(&self, scope: &OwnerScope, limit: usize) -> VectorStoreResult<Vec<StoredChunk>>;

    /// Every chunk in `scope`, newest first, capped at `cap`.
    async fn all(&self, scope: &OwnerScope, cap: usize) -> VectorStoreResult<Vec<StoredChunk>>;

    /// Remove every chunk in `scope`. Returns the number removed.
    async fn delete_conversation(&self, scope: &OwnerScope) -> VectorStoreResult<u64>;

    /// Remove the chunks of one document in `scope`. Returns the number removed.
    async fn delete_document(&self, scope: &OwnerScope, filename: &str)
    -> VectorStoreResult<u64>;

    async fn health_check(&self) -> VectorStoreResult<()>;
}

pub(crate) fn check_dimensions(expected: usize, vector: &[f64]) -> VectorStoreResult<()> {
    if vector.len() != expected {
        tracing::warn!(
            stage = "vector_operation_completed",
            status = "error",
            error = "dimension_mismatch",
            expected,
            actual = vector.len(),
            "Vector dimension mismatch"
        );
        return Err(VectorStoreError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
