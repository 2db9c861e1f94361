//! Document ingestion pipeline.
//!
//! `upload → route → extract (primary, then fallback chain) → validate →
//! chunk → per-chunk {embed → store} → aggregate`.
//!
//! PDFs stream page by page through [`StreamingIngest`] when the primary
//! extractor supports it; chunks are then written as pages arrive and the
//! batch chunking step is skipped. If the stream fails before anything was
//! written, the document is re-extracted through the batch path.
//!
//! Expected failures never panic or escape [`DocumentProcessor::ingest`]:
//! they come back as an [`IngestionResult`] with `success = false`.
//! [`DocumentProcessor::process`] surfaces hard failures as a
//! [`ProcessingError`] instead.

use std::{sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::{
    chunk_writer::ChunkWriter,
    chunker::Chunker,
    streaming_ingest::{StreamOutcome, StreamingIngest},
};
use crate::{
    cache::{EmbeddingService, vector_store::VectorBackend},
    config::{ChunkingConfig, IngestionConfig},
    error::ProcessingError,
    extraction::{
        ExtractedUnit, ExtractionError, ExtractionRequest, Extractor, FormatRouter,
        SmartExtractor, get_file_extension, is_supported_file_type,
    },
    fallback::{FallbackChain, FallbackError},
    models::{Document, FileInfo, IngestionResult, OwnerScope, non_empty},
    validation::ContentValidator,
};

#[derive(Debug, Default)]
struct StoreTally {
    stored: usize,
    failed: usize,
    errors: Vec<String>,
}

impl From<&mut StreamOutcome> for StoreTally {
    fn from(outcome: &mut StreamOutcome) -> Self {
        Self {
            stored: outcome.stored,
            failed: outcome.failed,
            errors: std::mem::take(&mut outcome.errors),
        }
    }
}

pub struct DocumentProcessor {
    config: IngestionConfig,
    chunker: Chunker,
    validator: ContentValidator,
    primary: Arc<SmartExtractor>,
    fallback: Arc<FormatRouter>,
    writer: ChunkWriter,
    streaming: StreamingIngest,
    store: Arc<dyn VectorBackend>,
}

impl DocumentProcessor {
    pub fn new(
        config: IngestionConfig,
        chunking: ChunkingConfig,
        primary: Arc<SmartExtractor>,
        fallback: Arc<FormatRouter>,
        embeddings: Arc<EmbeddingService>,
        store: Arc<dyn VectorBackend>,
    ) -> Self {
        let chunker = Chunker::new(&chunking);
        let writer = ChunkWriter::new(embeddings, store.clone());
        let streaming = StreamingIngest::new(
            writer.clone(),
            chunker.clone(),
            config.stream_concurrency,
            config.min_content_chars,
        );
        Self {
            validator: ContentValidator::new(config.min_content_chars),
            config,
            chunker,
            primary,
            fallback,
            writer,
            streaming,
            store,
        }
    }

    /// Ingest a document. Never fails: errors are reported in the result.
    pub async fn ingest(&self, document: Document) -> IngestionResult {
        self.ingest_with_cancel(document, &CancellationToken::new())
            .await
    }

    /// Like [`Self::ingest`], stopping early when `cancel` fires.
    ///
    /// Chunks stored before cancellation are kept.
    pub async fn ingest_with_cancel(
        &self,
        document: Document,
        cancel: &CancellationToken,
    ) -> IngestionResult {
        let start = Instant::now();
        let file_info = file_info(&document);
        match self.process_with_cancel(document, cancel).await {
            Ok(result) => result,
            Err(e) => IngestionResult::failed(&e, file_info, start.elapsed().as_secs_f64()),
        }
    }

    /// Ingest a document, surfacing hard failures as an error object.
    pub async fn process(&self, document: Document) -> Result<IngestionResult, ProcessingError> {
        self.process_with_cancel(document, &CancellationToken::new())
            .await
    }

    #[instrument(
        skip(self, document, cancel),
        fields(filename = %document.filename, scope = %document.scope, size = document.bytes.len())
    )]
    pub async fn process_with_cancel(
        &self,
        document: Document,
        cancel: &CancellationToken,
    ) -> Result<IngestionResult, ProcessingError> {
        let start_time = Instant::now();
        let mut file_info = file_info(&document);
        let extension = file_info.format.clone();
        let filename = document.filename.as_str();

        // Validation stage: reject before any extraction work
        info_span!("validate_upload", extension = %extension).in_scope(|| {
            self.check_upload(&document, &extension).inspect_err(|e| {
                info!(
                    stage = "validation_failed",
                    filename,
                    reason = %e.error_category,
                    "Upload rejected"
                );
            })
        })?;

        let mode = document.mode.unwrap_or(self.config.default_mode);
        let request = ExtractionRequest::new(document.bytes.clone(), filename)
            .with_mode(mode)
            .with_prompt(document.prompt.clone());

        let mut streamed: Option<StreamOutcome> = None;
        if self.config.streaming && self.primary.supports_streaming(&extension) {
            let stream = self.primary.extract_stream(request.clone());
            let outcome = self
                .streaming
                .run(stream, &document.scope, filename, cancel)
                .await;
            if outcome.failed_before_writing() {
                warn!(
                    stage = "stream_fallback",
                    filename,
                    error = ?outcome.stream_error,
                    "Streaming extraction failed, retrying in batch"
                );
            } else {
                streamed = Some(outcome);
            }
        }

        let (units, mut tally, cancelled) = match streamed {
            Some(mut outcome) => {
                let mut tally = StoreTally::from(&mut outcome);
                if let Some(e) = outcome.stream_error.take() {
                    tally.errors.push(format!("Extraction stopped early: {e}"));
                }
                (outcome.units, tally, outcome.cancelled)
            }
            None => {
                if cancel.is_cancelled() {
                    return Ok(cancelled_result(file_info, StoreTally::default(), start_time));
                }
                let units = self.extract_batch(&request).await?;
                (units, StoreTally::default(), false)
            }
        };

        file_info.content_length = units.iter().map(|u| u.text.chars().count()).sum();
        file_info.encoding = units
            .iter()
            .find_map(|u| u.meta_str("encoding"))
            .map(String::from);

        if cancelled {
            return Ok(cancelled_result(file_info, tally, start_time));
        }

        let validation = self.validator.validate(&units, &extension);
        if let Some(err) = validation.error(filename) {
            info!(
                stage = "validation_failed",
                filename,
                reason = ?validation.failure,
                "Extracted content rejected"
            );
            return Err(err);
        }
        for warning in &validation.warnings {
            debug!(stage = "validation_warning", filename, warning = %warning);
        }

        let already_written = tally.stored + tally.failed > 0;
        if !already_written {
            if let Some(result) = self
                .write_units(&units, &document.scope, filename, &mut tally, cancel)
                .await
            {
                return Ok(cancelled_result(file_info, result, start_time));
            }
        }

        let success = tally.stored > 0;
        let message = match (tally.stored, tally.failed) {
            (0, 0) => format!("No chunks were produced for '{filename}'"),
            (0, failed) => format!("Failed to store any of {failed} chunks for '{filename}'"),
            (stored, 0) => format!("Processed '{filename}': {stored} chunks stored"),
            (stored, failed) => format!(
                "Processed '{filename}' with errors: {stored} of {} chunks stored",
                stored + failed
            ),
        };

        let processing_time = start_time.elapsed().as_secs_f64();
        if success {
            info!(
                stage = "processing_completed",
                filename,
                stored_count = tally.stored,
                failed_count = tally.failed,
                warnings = validation.warnings.len(),
                total_duration_ms = (processing_time * 1000.0) as u64,
                "Document processing completed"
            );
        } else {
            error!(
                stage = "processing_failed",
                filename,
                failed_count = tally.failed,
                "No chunks stored for document"
            );
        }

        Ok(IngestionResult {
            success,
            message,
            chunk_count: tally.stored,
            processing_time: Some(processing_time),
            errors: non_empty(tally.errors),
            warnings: non_empty(validation.warnings),
            file_info,
        })
    }

    fn check_upload(&self, document: &Document, extension: &str) -> Result<(), ProcessingError> {
        if !is_supported_file_type(extension) {
            return Err(ProcessingError::unsupported_format(extension)
                .with_detail("filename", document.filename.as_str()));
        }
        if document.bytes.is_empty() {
            return Err(ProcessingError::empty_content(&document.filename));
        }
        let size = document.bytes.len() as u64;
        if size > self.config.max_file_size_bytes {
            return Err(ProcessingError::validation(format!(
                "File size {size} bytes exceeds the maximum of {} bytes",
                self.config.max_file_size_bytes
            ))
            .with_detail("filename", document.filename.as_str())
            .with_detail("size_bytes", size)
            .with_detail("max_file_size_bytes", self.config.max_file_size_bytes));
        }
        Ok(())
    }

    /// Primary extractor first, then the fallback chain. Terminal errors
    /// (empty input, unsupported format) skip the fallback.
    async fn extract_batch(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ProcessingError> {
        let stage_start = Instant::now();
        let resolved = FallbackChain::new()
            .then("primary", || self.primary.extract(request))
            .then("fallback", || self.fallback.extract(request))
            .stop_when(|e: &ExtractionError| e.is_terminal())
            .run()
            .await
            .map_err(|e| extraction_failure(e, &request.filename))?;

        info!(
            stage = "extraction_completed",
            filename = %request.filename,
            strategy = resolved.strategy,
            attempts = resolved.attempts,
            unit_count = resolved.value.len(),
            duration_ms = stage_start.elapsed().as_millis() as u64,
            "Extraction completed"
        );
        Ok(resolved.value)
    }

    /// Chunk and write sequentially. Returns the tally early when cancelled.
    async fn write_units(
        &self,
        units: &[ExtractedUnit],
        scope: &OwnerScope,
        filename: &str,
        tally: &mut StoreTally,
        cancel: &CancellationToken,
    ) -> Option<StoreTally> {
        let stage_start = Instant::now();
        let drafts = info_span!("chunk_text", unit_count = units.len())
            .in_scope(|| self.chunker.chunk_units(units, filename, scope));
        let chunk_count = drafts.len();
        info!(
            stage = "chunking_completed",
            filename,
            chunk_count,
            duration_ms = stage_start.elapsed().as_millis() as u64,
            "Text chunking completed"
        );

        let embedding_span = info_span!("embed_and_store_chunks", chunk_count);
        async {
            info!(
                stage = "embedding_started",
                filename,
                chunk_count,
                "Starting embedding generation and storage"
            );
            for draft in drafts {
                if cancel.is_cancelled() {
                    info!(stage = "processing_cancelled", filename, stored_count = tally.stored);
                    return Some(std::mem::take(tally));
                }
                let chunk_index = draft.index;
                let chunk_size = draft.content.len();
                match self.writer.write(scope, filename, draft).await {
                    Ok(id) => {
                        tally.stored += 1;
                        debug!(
                            stage = "chunk_stored",
                            chunk_index,
                            chunk_size,
                            chunk_id = %id,
                            "Chunk embedded and stored"
                        );
                    }
                    Err(e) => {
                        tally.failed += 1;
                        warn!(
                            stage = "chunk_storage_failed",
                            chunk_index,
                            error = %e,
                            "Failed to store chunk"
                        );
                        tally.errors.push(format!("Chunk {chunk_index}: {e}"));
                    }
                }
            }
            info!(
                stage = "embedding_completed",
                filename,
                chunk_count,
                stored_count = tally.stored,
                failed_count = tally.failed,
                duration_ms = stage_start.elapsed().as_millis() as u64,
                "Embedding generation and storage completed"
            );
            None
        }
        .instrument(embedding_span)
        .await
    }

    /// Remove every chunk in a conversation. Returns the number removed.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn delete_conversation(&self, scope: &OwnerScope) -> Result<u64, ProcessingError> {
        let removed = self
            .store
            .delete_conversation(scope)
            .await
            .map_err(|e| ProcessingError::system(e.to_string()))?;
        info!(stage = "conversation_deleted", removed, "Deleted conversation chunks");
        Ok(removed)
    }

    /// Remove one document's chunks. Returns the number removed.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn delete_document(
        &self,
        scope: &OwnerScope,
        filename: &str,
    ) -> Result<u64, ProcessingError> {
        let removed = self
            .store
            .delete_document(scope, filename)
            .await
            .map_err(|e| ProcessingError::system(e.to_string()))?;
        info!(stage = "document_deleted", removed, "Deleted document chunks");
        Ok(removed)
    }
}

impl std::fmt::Debug for DocumentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProcessor")
            .field("config", &self.config)
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .finish()
    }
}

fn file_info(document: &Document) -> FileInfo {
    FileInfo {
        filename: document.filename.clone(),
        format: get_file_extension(&document.filename),
        size_bytes: document.bytes.len() as u64,
        content_length: 0,
        encoding: None,
    }
}

fn cancelled_result(file_info: FileInfo, tally: StoreTally, start: Instant) -> IngestionResult {
    let mut errors = tally.errors;
    errors.push("Ingestion was cancelled".to_string());
    IngestionResult {
        success: tally.stored > 0,
        message: format!(
            "Ingestion of '{}' cancelled after {} chunks",
            file_info.filename, tally.stored
        ),
        chunk_count: tally.stored,
        processing_time: Some(start.elapsed().as_secs_f64()),
        errors: Some(errors),
        warnings: None,
        file_info,
    }
}

fn extraction_failure(err: FallbackError<ExtractionError>, filename: &str) -> ProcessingError {
    match err {
        FallbackError::Terminal { strategy, source } => ProcessingError::from(source)
            .with_detail("filename", filename)
            .with_detail("strategy", strategy),
        FallbackError::Exhausted { failures } => {
            let attempts: Vec<String> = failures
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect();
            error!(
                stage = "extraction_failed",
                filename,
                attempts = ?attempts,
                "Every extraction strategy failed"
            );
            let last = failures.into_iter().last().map(|(_, e)| e);
            let base = match last {
                Some(e) => ProcessingError::from(e),
                None => ProcessingError::system("extraction failed"),
            };
            base.with_detail("filename", filename)
                .with_detail("attempts", attempts)
        }
        FallbackError::Empty => ProcessingError::system("no extractors configured"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        cache::vector_store::InMemoryVectorStore,
        config::EmbeddingConfig,
        error::ErrorCategory,
        extraction::{
            SUPPORTED_EXTENSIONS,
            pdf::sample_pdf,
            vision::{VisionAnalyzer, test_support::ScriptedVision},
        },
    };

    const DIMS: usize = 16;

    fn processor_with(
        config: IngestionConfig,
        vision: Option<Arc<dyn VisionAnalyzer>>,
    ) -> (DocumentProcessor, Arc<InMemoryVectorStore>) {
        let store = Arc::new(InMemoryVectorStore::new(DIMS));
        let embeddings = Arc::new(EmbeddingService::new(
            &EmbeddingConfig {
                dimensions: DIMS,
                ..Default::default()
            },
            reqwest::Client::new(),
        ));
        let processor = DocumentProcessor::new(
            config,
            ChunkingConfig {
                chunk_size: 200,
                chunk_overlap: 20,
            },
            Arc::new(SmartExtractor::new(vision, 100)),
            Arc::new(FormatRouter::fallback_chain()),
            embeddings,
            store.clone(),
        );
        (processor, store)
    }

    fn processor() -> (DocumentProcessor, Arc<InMemoryVectorStore>) {
        processor_with(IngestionConfig::default(), None)
    }

    fn scope() -> OwnerScope {
        OwnerScope::new("user-1", "conv-1")
    }

    #[rstest]
    #[case("exe")]
    #[case("doc")]
    #[case("")]
    #[tokio::test]
    async fn test_unsupported_extension_rejected(#[case] ext: &str) {
        let (processor, store) = processor();
        let filename = if ext.is_empty() { "README".to_string() } else { format!("file.{ext}") };
        let err = processor
            .process(Document::new(&b"content"[..], filename, scope()))
            .await
            .unwrap_err();
        assert_eq!(err.error_category, ErrorCategory::UnsupportedFormat);
        assert!(err.is_user_error());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_bytes_for_every_supported_extension() {
        let (processor, _) = processor();
        for ext in SUPPORTED_EXTENSIONS {
            let err = processor
                .process(Document::new(Vec::new(), format!("empty.{ext}"), scope()))
                .await
                .unwrap_err();
            assert_eq!(err.error_category, ErrorCategory::EmptyContent, "{ext}");
        }
    }

    #[tokio::test]
    async fn test_oversized_file_is_validation_error() {
        let (processor, _) = processor_with(
            IngestionConfig {
                max_file_size_bytes: 8,
                ..Default::default()
            },
            None,
        );
        let err = processor
            .process(Document::new(&b"more than eight bytes"[..], "big.txt", scope()))
            .await
            .unwrap_err();
        assert_eq!(err.error_category, ErrorCategory::ValidationError);
    }

    #[tokio::test]
    async fn test_insufficient_content() {
        let (processor, store) = processor();
        let err = processor
            .process(Document::new(&b"hi"[..], "tiny.txt", scope()))
            .await
            .unwrap_err();
        assert_eq!(err.error_category, ErrorCategory::InsufficientContent);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_never_errors() {
        let (processor, _) = processor();
        let result = processor
            .ingest(Document::new(&b"hi"[..], "tiny.txt", scope()))
            .await;
        assert!(!result.success);
        assert_eq!(result.chunk_count, 0);
        assert_eq!(result.file_info.format, "txt");
        assert!(result.errors.unwrap()[0].contains("InsufficientContent"));
    }

    #[tokio::test]
    async fn test_text_document_stored() {
        let (processor, store) = processor();
        let text = "Quarterly revenue grew by twelve percent.\n\n".repeat(10);
        let result = processor
            .process(Document::new(text.into_bytes(), "report.txt", scope()))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.chunk_count > 1);
        assert_eq!(result.chunk_count, store.len());
        assert_eq!(result.file_info.encoding.as_deref(), Some("utf-8"));
        assert!(result.errors.is_none());

        let rows = store.all(&scope(), 100).await.unwrap();
        assert!(rows.iter().all(|r| r.metadata["embedding_source"] == "fallback"));
        assert!(rows.iter().all(|r| r.filename == "report.txt"));
    }

    #[tokio::test]
    async fn test_low_content_warning_surfaces() {
        let (processor, _) = processor();
        let result = processor
            .process(Document::new(&b"short note here"[..], "note.txt", scope()))
            .await
            .unwrap();
        assert!(result.success);
        let warnings = result.warnings.unwrap();
        assert!(warnings[0].starts_with("Very little content"));
    }

    #[tokio::test]
    async fn test_chemistry_skips_malformed_record() {
        let (processor, store) = processor();
        let water = "\
Water
  test

  3  2  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
    0.9600    0.0000    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
   -0.2400    0.9300    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0  0  0  0
  1  3  1  0  0  0  0
M  END
";
        let sdf = format!("{water}$$$$\n{water}$$$$\nBroken\n\n\n  x  y\nnot an atom\n$$$$\n{water}$$$$\n");
        let result = processor
            .process(Document::new(sdf.into_bytes(), "set.sdf", scope()))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.chunk_count, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_pdf_streams_pages() {
        let (processor, store) = processor();
        let long = "Digital page text. ".repeat(8);
        let pdf = sample_pdf(&[&long, &long]);

        let result = processor
            .process(Document::new(pdf, "paper.pdf", scope()))
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.chunk_count, store.len());
        let rows = store.all(&scope(), 100).await.unwrap();
        assert!(rows.iter().any(|r| r.metadata.get("page_number").is_some()));
    }

    #[tokio::test]
    async fn test_scanned_pdf_without_vision_falls_back_to_text() {
        let (processor, store) = processor();
        let pdf = sample_pdf(&["Short scan page", "Another short page"]);

        let result = processor
            .process(Document::new(pdf, "scan.pdf", scope()))
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert!(store.len() >= 1);
    }

    #[tokio::test]
    async fn test_scanned_pdf_with_failing_vision_page() {
        let vision = Arc::new(
            ScriptedVision::replying("A described page of handwritten notes.").failing_on(&[2]),
        );
        let analyzer = vision.clone() as Arc<dyn VisionAnalyzer>;
        let (processor, _) = processor_with(IngestionConfig::default(), Some(analyzer));
        let pdf = sample_pdf(&["p1", "p2", "p3"]);

        let result = processor
            .process(Document::new(pdf, "scan.pdf", scope()))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(vision.call_count(), 3);
        let warnings = result.warnings.unwrap_or_default();
        assert!(warnings.iter().any(|w| w.contains("Vision analysis failed for 1 page")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_stores_nothing() {
        let (processor, store) = processor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let text = "Plenty of text in this file to be ingested.";
        let result = processor
            .ingest_with_cancel(Document::new(text.as_bytes(), "a.txt", scope()), &cancel)
            .await;

        assert!(!result.success);
        assert!(result.errors.unwrap().iter().any(|e| e.contains("cancelled")));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_document_and_conversation() {
        let (processor, store) = processor();
        for name in ["a.txt", "b.txt"] {
            let result = processor
                .process(Document::new("Some meaningful text content.".as_bytes(), name, scope()))
                .await
                .unwrap();
            assert!(result.success);
        }

        assert_eq!(processor.delete_document(&scope(), "a.txt").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(processor.delete_conversation(&scope()).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
