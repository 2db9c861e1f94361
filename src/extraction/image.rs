use async_trait::async_trait;

use super::{ExtractedUnit, ExtractionError, ExtractionRequest, Extractor, is_image_type};

/// Marker that opens every image placeholder unit.
pub const IMAGE_PLACEHOLDER_PREFIX: &str = "[Image:";

/// Produces a single placeholder unit for raster images.
///
/// The meaningful representation of an image is the description produced by
/// the vision-capable primary extractor; this keeps the file discoverable by
/// name when that is unavailable.
#[derive(Debug, Default)]
pub struct ImageExtractor;

#[async_trait]
impl Extractor for ImageExtractor {
    fn name(&self) -> &'static str {
        "image_placeholder"
    }

    fn can_handle(&self, extension: &str) -> bool {
        is_image_type(extension)
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }
        let text = format!(
            "{} {}] Uploaded image ({} bytes, {}). No description available.",
            IMAGE_PLACEHOLDER_PREFIX,
            request.filename,
            request.bytes.len(),
            request.extension
        );
        Ok(vec![
            ExtractedUnit::new(text)
                .with_meta("extractor", self.name())
                .with_meta("content_type", "image")
                .with_meta("size_bytes", request.bytes.len()),
        ])
    }
}
