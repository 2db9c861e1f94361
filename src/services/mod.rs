pub mod chunk_writer;
pub mod chunker;
mod document_processor;
mod retrieval;
pub mod streaming_ingest;

pub use chunk_writer::{ChunkWriteError, ChunkWriter};
pub use chunker::{ChunkDraft, Chunker};
pub use document_processor::DocumentProcessor;
pub use retrieval::{
    Retrieval, RetrievalError, RetrievalQuery, RetrievalService, RetrievalTier, assemble_context,
    group_by_document,
};
pub use streaming_ingest::{StreamOutcome, StreamingIngest};
