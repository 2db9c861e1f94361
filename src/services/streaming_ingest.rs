//! Page-by-page ingestion under a bounded-concurrency gate.
//!
//! Units are chunked as soon as the extractor emits them, and each chunk is
//! embedded and stored on its own task. A semaphore caps simultaneous
//! writes, so a long document never has more than `concurrency` embedding
//! calls in flight. Units are held back until the document has produced
//! `min_chars` characters; a document that never gets there is rejected by
//! validation without anything having been stored.

use std::sync::Arc;

use futures::StreamExt;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    chunk_writer::{ChunkWriteError, ChunkWriter},
    chunker::Chunker,
};
use crate::{
    extraction::{ExtractedUnit, ExtractionError, UnitStream},
    models::OwnerScope,
};

type WriteTask = (usize, Result<Uuid, ChunkWriteError>);

/// What a streamed ingestion produced.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Every unit received, for validation and statistics.
    pub units: Vec<ExtractedUnit>,
    pub stored: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    /// The error that ended the stream early, if any.
    pub stream_error: Option<ExtractionError>,
    pub cancelled: bool,
}

impl StreamOutcome {
    /// True when the stream failed before anything was written, so the
    /// document can be re-extracted in batch without duplicating chunks.
    pub fn failed_before_writing(&self) -> bool {
        self.stream_error.is_some() && self.stored == 0 && self.failed == 0
    }
}

pub struct StreamingIngest {
    writer: ChunkWriter,
    chunker: Chunker,
    concurrency: usize,
    min_chars: usize,
}

impl StreamingIngest {
    pub fn new(
        writer: ChunkWriter,
        chunker: Chunker,
        concurrency: usize,
        min_chars: usize,
    ) -> Self {
        Self {
            writer,
            chunker,
            concurrency: concurrency.max(1),
            min_chars,
        }
    }

    #[instrument(
        skip_all,
        fields(filename = %filename, scope = %scope, concurrency = self.concurrency)
    )]
    pub async fn run(
        &self,
        mut stream: UnitStream,
        scope: &OwnerScope,
        filename: &str,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<WriteTask> = JoinSet::new();
        let mut outcome = StreamOutcome::default();
        let mut pending: Vec<ExtractedUnit> = Vec::new();
        let mut seen_chars = 0usize;
        let mut next_index = 0usize;

        'units: loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };

            match item {
                Ok(unit) => {
                    seen_chars += unit.text.trim().chars().count();
                    outcome.units.push(unit.clone());
                    pending.push(unit);
                    if seen_chars < self.min_chars {
                        continue;
                    }
                    for unit in std::mem::take(&mut pending) {
                        let drafts = self.chunker.chunk_unit(&unit, filename, scope, next_index);
                        next_index += drafts.len();
                        for draft in drafts {
                            let permit = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => {
                                    outcome.cancelled = true;
                                    break 'units;
                                }
                                permit = gate.clone().acquire_owned() => permit,
                            };
                            let Ok(permit) = permit else { break 'units };

                            let writer = self.writer.clone();
                            let scope = scope.clone();
                            let filename = filename.to_string();
                            tasks.spawn(
                                async move {
                                    let _permit = permit;
                                    let index = draft.index;
                                    (index, writer.write(&scope, &filename, draft).await)
                                }
                                .in_current_span(),
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        stage = "stream_failed",
                        error = %e,
                        units_received = outcome.units.len(),
                        "Streaming extraction ended with an error"
                    );
                    outcome.stream_error = Some(e);
                    break;
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                record(joined, &mut outcome);
            }
        }

        if outcome.cancelled {
            info!(
                stage = "stream_cancelled",
                in_flight = tasks.len(),
                "Streaming ingestion cancelled"
            );
            tasks.abort_all();
        }
        while let Some(joined) = tasks.join_next().await {
            record(joined, &mut outcome);
        }

        info!(
            stage = "stream_completed",
            units = outcome.units.len(),
            stored_count = outcome.stored,
            failed_count = outcome.failed,
            "Streaming ingestion finished"
        );
        outcome
    }
}

fn record(joined: Result<WriteTask, JoinError>, outcome: &mut StreamOutcome) {
    match joined {
        Ok((chunk_index, Ok(id))) => {
            outcome.stored += 1;
            debug!(
                stage = "chunk_stored",
                chunk_index,
                chunk_id = %id,
                "Chunk embedded and stored"
            );
        }
        Ok((chunk_index, Err(e))) => {
            outcome.failed += 1;
            warn!(stage = "chunk_storage_failed", chunk_index, error = %e, "Failed to store chunk");
            outcome.errors.push(format!("Chunk {chunk_index}: {e}"));
        }
        // Aborted by cancellation; the chunk may or may not have been stored.
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            outcome.failed += 1;
            warn!(stage = "chunk_storage_failed", error = %e, "Chunk task panicked");
            outcome.errors.push(format!("Chunk task failed: {e}"));
        }
    }
}
