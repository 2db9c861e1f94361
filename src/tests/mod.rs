//! End-to-end tests across ingestion, retrieval and generation.
//!
//! Pipelines are wired through [`crate::Grounding::from_config`] with the
//! in-memory store; completion backends are wiremock servers.

mod failover_e2e;
mod pipeline_e2e;
