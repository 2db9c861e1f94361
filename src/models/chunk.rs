use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The (user, conversation) pair that bounds visibility of stored chunks.
///
/// Every store write and every query carries one; no retrieval path may
/// return a chunk stored under a different scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope {
    pub user_id: String,
    pub conversation_id: String,
}

impl OwnerScope {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl std::fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.conversation_id)
    }
}

/// A text window with its embedding, ready to be persisted.
///
/// Chunks are immutable once stored and are only removed by bulk
/// conversation or document deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub scope: OwnerScope,
    /// Source filename, used to group results by document.
    pub filename: String,
    pub content: String,
    pub embedding: Vec<f64>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A stored chunk as returned by the store, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: Uuid,
    pub filename: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl From<&Chunk> for StoredChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id,
            filename: chunk.filename.clone(),
            content: chunk.content.clone(),
            metadata: chunk.metadata.clone(),
            created_at: chunk.created_at,
        }
    }
}

/// One retrieval row: `{ id, content, metadata, similarity, created_at }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub chunk: StoredChunk,
    /// Score in 0..=1. Fallback tiers report a neutral value.
    pub similarity: f64,
    pub retrieved_at: DateTime<Utc>,
}

impl SearchResult {
    pub fn new(chunk: StoredChunk, similarity: f64) -> Self {
        Self {
            chunk,
            similarity,
            retrieved_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_result_contract_shape() {
        let chunk = StoredChunk {
            id: Uuid::nil(),
            filename: "notes.txt".into(),
            content: "hello".into(),
            metadata: Map::new(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(SearchResult::new(chunk, 0.9)).unwrap();

        for field in ["id", "content", "metadata", "similarity", "created_at"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }
}
