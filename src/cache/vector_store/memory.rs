//! Process-local vector store.
//!
//! Rows live in a `DashMap` keyed by owner scope, so a scoped query never
//! looks at another scope's rows. Similarity is cosine, clamped to 0..=1.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{VectorBackend, VectorStoreResult, check_dimensions};
use crate::models::{Chunk, OwnerScope, SearchResult, StoredChunk};

pub struct InMemoryVectorStore {
    dimensions: usize,
    scopes: DashMap<OwnerScope, Vec<Chunk>>,
}

impl InMemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            scopes: DashMap::new(),
        }
    }

    /// Total chunks across all scopes.
    pub fn len(&self) -> usize {
        self.scopes.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn newest_first(&self, scope: &OwnerScope, limit: usize) -> Vec<StoredChunk> {
        let Some(chunks) = self.scopes.get(scope) else {
            return Vec::new();
        };
        let mut rows: Vec<&Chunk> = chunks.iter().collect();
        // Later inserts win ties on created_at.
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.into_iter().take(limit).map(StoredChunk::from).collect()
    }
}

pub(crate) fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[async_trait]
impl VectorBackend for InMemoryVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn insert(&self, chunk: Chunk) -> VectorStoreResult<()> {
        check_dimensions(self.dimensions, &chunk.embedding)?;
        self.scopes.entry(chunk.scope.clone()).or_default().push(chunk);
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f64],
        scope: &OwnerScope,
        threshold: f64,
        limit: usize,
    ) -> VectorStoreResult<Vec<SearchResult>> {
        check_dimensions(self.dimensions, embedding)?;
        let Some(chunks) = self.scopes.get(scope) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f64, &Chunk)> = chunks
            .iter()
            .map(|chunk| (cosine_similarity(embedding, &chunk.embedding), chunk))
            .filter(|(similarity, _)| *similarity >= threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let results: Vec<SearchResult> = scored
            .into_iter()
            .take(limit)
            .map(|(similarity, chunk)| SearchResult::new(StoredChunk::from(chunk), similarity))
            .collect();
        debug!(
            stage = "vector_operation_completed",
            backend = "memory",
            operation = "search",
            threshold,
            item_count = results.len(),
            "Vector search completed"
        );
        Ok(results)
    }

    async fn recent(
        &self,
        scope: &OwnerScope,
        limit: usize,
    ) -> VectorStoreResult<Vec<StoredChunk>> {
        Ok(self.newest_first(scope, limit))
    }

    async fn all(&self, scope: &OwnerScope, cap: usize) -> VectorStoreResult<Vec<StoredChunk>> {
        Ok(self.newest_first(scope, cap))
    }

    async fn delete_conversation(&self, scope: &OwnerScope) -> VectorStoreResult<u64> {
        Ok(self
            .scopes
            .remove(scope)
            .map(|(_, chunks)| chunks.len() as u64)
            .unwrap_or(0))
    }

    async fn delete_document(
        &self,
        scope: &OwnerScope,
        filename: &str,
    ) -> VectorStoreResult<u64> {
        let Some(mut chunks) = self.scopes.get_mut(scope) else {
            return Ok(0);
        };
        let before = chunks.len();
        chunks.retain(|chunk| chunk.filename != filename);
        Ok((before - chunks.len()) as u64)
    }

    async fn health_check(&self) -> VectorStoreResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .field("dimensions", &self.dimensions)
            .field("scopes", &self.scopes.len())
            .finish()
    }
}
