//! Observability: structured logging via `tracing`.
//!
//! Pipeline stages emit events with a `stage` field (for example
//! `extraction_started`, `chunk_stored`, `provider_failed`) so logs can be
//! filtered per stage in any of the supported formats.

mod tracing_init;

pub use tracing_init::*;
