use std::sync::Arc;

use async_trait::async_trait;

use super::{
    ChemistryExtractor, ExtractedUnit, ExtractionError, ExtractionRequest, Extractor,
    ImageExtractor, OfficeExtractor, PdfTextExtractor, SpreadsheetExtractor, TextExtractor,
};

/// Ordered strategy registry: the first extractor that handles an extension wins.
///
/// Adding a format means registering another [`Extractor`]; nothing else
/// dispatches on extensions.
#[derive(Default)]
pub struct FormatRouter {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl FormatRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractors.push(Arc::new(extractor));
        self
    }

    /// Extractors used when the primary extractor fails: no vision, and the
    /// line-oriented structure parser.
    pub fn fallback_chain() -> Self {
        Self::new()
            .register(TextExtractor)
            .register(OfficeExtractor::new(None))
            .register(SpreadsheetExtractor)
            .register(ChemistryExtractor::lenient())
            .register(ImageExtractor)
            .register(PdfTextExtractor)
    }

    /// Extractors without vision, using the strict structure parser.
    pub fn standard() -> Self {
        Self::new()
            .register(TextExtractor)
            .register(OfficeExtractor::new(None))
            .register(SpreadsheetExtractor)
            .register(ChemistryExtractor::new())
            .register(ImageExtractor)
            .register(PdfTextExtractor)
    }

    pub fn route(&self, extension: &str) -> Option<&Arc<dyn Extractor>> {
        self.extractors.iter().find(|e| e.can_handle(extension))
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl std::fmt::Debug for FormatRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extractors.iter().map(|e| e.name()))
            .finish()
    }
}

#[async_trait]
impl Extractor for FormatRouter {
    fn name(&self) -> &'static str {
        "format_router"
    }

    fn can_handle(&self, extension: &str) -> bool {
        self.route(extension).is_some()
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        let extractor = self
            .route(&request.extension)
            .ok_or_else(|| ExtractionError::UnsupportedFormat(request.extension.clone()))?;
        tracing::debug!(
            stage = "routed",
            filename = %request.filename,
            extractor = extractor.name(),
            "Routing document to extractor"
        );
        extractor.extract(request).await
    }
}
