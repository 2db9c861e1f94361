//! The primary, vision-capable extractor.
//!
//! PDFs are read page by page. When the average text per page falls below
//! the scanned threshold (or in detailed mode with vision configured), each
//! page is sent to the vision capability as a single-page document. Raster
//! images are always described by vision. Office files go through an
//! [`OfficeExtractor`] that can see embedded images. Everything else uses
//! the standard extractors.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use lopdf::Document;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ExtractedUnit, ExtractionError, ExtractionMode, ExtractionRequest, Extractor, FormatRouter,
    IMAGE_PLACEHOLDER_PREFIX, OfficeExtractor, UnitStream, image_mime, is_image_type,
    is_supported_file_type, pdf, run_blocking,
    vision::{VisionAnalyzer, VisionInput},
};

/// Pages buffered between the page worker and the consumer.
const PAGE_CHANNEL_CAPACITY: usize = 4;

pub struct SmartExtractor {
    vision: Option<Arc<dyn VisionAnalyzer>>,
    scanned_chars_per_page: usize,
    office: OfficeExtractor,
    standard: FormatRouter,
}

impl SmartExtractor {
    pub fn new(vision: Option<Arc<dyn VisionAnalyzer>>, scanned_chars_per_page: usize) -> Self {
        Self {
            office: OfficeExtractor::new(vision.clone()),
            vision,
            scanned_chars_per_page,
            standard: FormatRouter::standard(),
        }
    }

    pub fn has_vision(&self) -> bool {
        self.vision.is_some()
    }

    /// Whether [`Self::extract_stream`] emits units progressively for this extension.
    pub fn supports_streaming(&self, extension: &str) -> bool {
        extension == "pdf"
    }

    /// Emit units as they are produced.
    ///
    /// Only PDFs stream page by page. Dropping the stream stops the page
    /// worker at its next send.
    pub fn extract_stream(&self, request: ExtractionRequest) -> UnitStream {
        if !self.supports_streaming(&request.extension) {
            let ext = request.extension;
            return futures::stream::once(async move {
                Err(ExtractionError::Internal(format!(
                    "streaming extraction is not available for '{ext}'"
                )))
            })
            .boxed();
        }

        let (tx, rx) = mpsc::channel(PAGE_CHANNEL_CAPACITY);
        let job = PdfJob {
            vision: self.vision.clone(),
            scanned_chars_per_page: self.scanned_chars_per_page,
            request,
        };
        tokio::spawn(job.run(tx));

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn extract_image(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        let vision = self
            .vision
            .as_ref()
            .ok_or(ExtractionError::VisionUnavailable)?;
        let input = VisionInput::Image {
            bytes: request.bytes.clone(),
            mime: image_mime(&request.extension),
        };
        let description = vision
            .describe(input, request.prompt.as_deref())
            .await
            .map_err(|e| ExtractionError::Vision(e.to_string()))?;

        Ok(vec![
            ExtractedUnit::new(format!(
                "{} {}]\n{}",
                IMAGE_PLACEHOLDER_PREFIX, request.filename, description
            ))
            .with_meta("extractor", self.name())
            .with_meta("content_type", "image")
            .with_meta("extraction_method", "vision")
            .with_meta("vision_model", vision.model_name()),
        ])
    }
}

impl std::fmt::Debug for SmartExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartExtractor")
            .field("vision", &self.vision.as_ref().map(|v| v.model_name().to_string()))
            .field("scanned_chars_per_page", &self.scanned_chars_per_page)
            .finish()
    }
}

#[async_trait]
impl Extractor for SmartExtractor {
    fn name(&self) -> &'static str {
        "smart"
    }

    fn can_handle(&self, extension: &str) -> bool {
        is_supported_file_type(extension)
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }
        match request.extension.as_str() {
            "pdf" => self.extract_stream(request.clone()).try_collect().await,
            ext if is_image_type(ext) => self.extract_image(request).await,
            "docx" | "pptx" => self.office.extract(request).await,
            _ => self.standard.extract(request).await,
        }
    }
}

/// Owned state for one PDF page worker.
struct PdfJob {
    vision: Option<Arc<dyn VisionAnalyzer>>,
    scanned_chars_per_page: usize,
    request: ExtractionRequest,
}

type PageSender = mpsc::Sender<Result<ExtractedUnit, ExtractionError>>;

impl PdfJob {
    async fn run(self, tx: PageSender) {
        let bytes = self.request.bytes.clone();
        let loaded = run_blocking(move || {
            let doc = pdf::load(&bytes)?;
            let pages = pdf::page_texts(&doc);
            Ok((doc, pages))
        })
        .await;
        let (doc, pages) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let total = pages.len();
        let chars: usize = pages.iter().map(|(_, text)| text.chars().count()).sum();
        let average = if total == 0 { 0 } else { chars / total };
        let scanned = total > 0 && average < self.scanned_chars_per_page;
        let detailed = self.request.mode == ExtractionMode::Detailed;

        let vision = match (&self.vision, scanned || detailed) {
            (Some(vision), true) => Some(vision.clone()),
            (None, true) if scanned => {
                let _ = tx.send(Err(ExtractionError::VisionUnavailable)).await;
                return;
            }
            _ => None,
        };

        info!(
            stage = "pdf_analyzed",
            filename = %self.request.filename,
            pages = total,
            average_chars_per_page = average,
            scanned,
            vision = vision.is_some(),
            "Analyzed PDF"
        );

        let doc = Arc::new(doc);
        for (page, text) in pages {
            let unit = match &vision {
                Some(vision) => self.vision_page(vision.as_ref(), &doc, page, text).await,
                None => ExtractedUnit::new(text).with_meta("extraction_method", "text"),
            };
            let unit = unit
                .with_meta("extractor", "smart")
                .with_meta("page_number", page)
                .with_meta("total_pages", total)
                .with_meta("scanned", scanned);
            if tx.send(Ok(unit)).await.is_err() {
                debug!(
                    filename = %self.request.filename,
                    page,
                    "Page consumer dropped, stopping PDF extraction"
                );
                return;
            }
        }
    }

    /// Describe one page. A failure keeps a placeholder plus any extracted text.
    async fn vision_page(
        &self,
        vision: &dyn VisionAnalyzer,
        doc: &Arc<Document>,
        page: u32,
        text: String,
    ) -> ExtractedUnit {
        let source = doc.clone();
        let described = match run_blocking(move || pdf::single_page(&source, page)).await {
            Ok(bytes) => vision
                .describe(
                    VisionInput::PdfPage {
                        bytes: bytes.into(),
                        page,
                    },
                    self.request.prompt.as_deref(),
                )
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match described {
            Ok(description) => ExtractedUnit::new(description)
                .with_meta("extraction_method", "vision")
                .with_meta("vision_model", vision.model_name()),
            Err(error) => {
                warn!(
                    stage = "page_vision_failed",
                    filename = %self.request.filename,
                    page,
                    error = %error,
                    "Vision analysis failed, keeping placeholder"
                );
                let mut body = format!("[Page {page}: vision analysis failed]");
                if !text.is_empty() {
                    body.push('\n');
                    body.push_str(&text);
                }
                ExtractedUnit::new(body)
                    .with_meta("extraction_method", "vision_failed")
                    .with_meta("vision_error", error)
            }
        }
    }
}
