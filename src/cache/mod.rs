mod embedding_service;
mod memory;
pub mod vector_store;

pub use embedding_service::{Embedding, EmbeddingError, EmbeddingService, EmbeddingSource};
pub use memory::{CacheStats, EmbeddingCache};
