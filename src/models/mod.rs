mod chunk;
mod ingestion;

pub use chunk::*;
pub use ingestion::*;
