//! Word (`.docx`) and PowerPoint (`.pptx`) extraction.
//!
//! Text comes straight from the OOXML parts. When a [`VisionAnalyzer`] is
//! supplied, embedded images are described and appended to the owning unit
//! under an `--- Images ---` section. A failed description is logged and
//! skipped; it never fails the document.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    ExtractedUnit, ExtractionError, ExtractionMode, ExtractionRequest, Extractor,
    get_file_extension, image_mime, is_image_type, ooxml, run_blocking,
    vision::{VisionAnalyzer, VisionInput},
};

/// Upper bound on embedded images described per document.
const MAX_IMAGES_PER_DOCUMENT: usize = 50;

const IMAGES_HEADER: &str = "--- Images ---";

/// A text unit plus the embedded images that belong to it.
struct OfficePart {
    text: String,
    metadata: Map<String, Value>,
    images: Vec<(String, Bytes)>,
}

pub struct OfficeExtractor {
    vision: Option<Arc<dyn VisionAnalyzer>>,
}

impl OfficeExtractor {
    pub fn new(vision: Option<Arc<dyn VisionAnalyzer>>) -> Self {
        Self { vision }
    }

    /// Slide images are always described; document images only in detailed mode.
    fn wants_images(&self, request: &ExtractionRequest) -> bool {
        self.vision.is_some()
            && (request.extension == "pptx" || request.mode == ExtractionMode::Detailed)
    }

    async fn describe_images(
        &self,
        vision: &dyn VisionAnalyzer,
        filename: &str,
        images: Vec<(String, Bytes)>,
        prompt: Option<&str>,
    ) -> (Vec<String>, usize) {
        let mut descriptions = Vec::new();
        let mut failed = 0;
        for (name, bytes) in images {
            let mime = image_mime(&get_file_extension(&name));
            match vision.describe(VisionInput::Image { bytes, mime }, prompt).await {
                Ok(text) => {
                    let short = name.rsplit('/').next().unwrap_or(&name);
                    descriptions.push(format!(
                        "[Image {}: {}]\n{}",
                        descriptions.len() + 1,
                        short,
                        text
                    ));
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        stage = "image_analysis_failed",
                        filename = %filename,
                        image = %name,
                        error = %e,
                        "Skipping embedded image"
                    );
                }
            }
        }
        (descriptions, failed)
    }
}

impl std::fmt::Debug for OfficeExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficeExtractor")
            .field("vision", &self.vision.as_ref().map(|v| v.model_name().to_string()))
            .finish()
    }
}

#[async_trait]
impl Extractor for OfficeExtractor {
    fn name(&self) -> &'static str {
        "office"
    }

    fn can_handle(&self, extension: &str) -> bool {
        matches!(extension, "docx" | "pptx")
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }

        let bytes = request.bytes.clone();
        let extension = request.extension.clone();
        let with_images = self.wants_images(request);
        let parts = run_blocking(move || match extension.as_str() {
            "docx" => parse_docx(&bytes, with_images),
            "pptx" => parse_pptx(&bytes, with_images),
            other => Err(ExtractionError::UnsupportedFormat(other.to_string())),
        })
        .await?;

        let mut units = Vec::with_capacity(parts.len());
        let mut budget = MAX_IMAGES_PER_DOCUMENT;
        for part in parts {
            let mut text = part.text;
            let mut unit_meta = part.metadata;

            if let Some(vision) = &self.vision
                && !part.images.is_empty()
                && budget > 0
            {
                let images: Vec<_> = part.images.into_iter().take(budget).collect();
                budget -= images.len();
                let (descriptions, failed) = self
                    .describe_images(
                        vision.as_ref(),
                        &request.filename,
                        images,
                        request.prompt.as_deref(),
                    )
                    .await;
                if !descriptions.is_empty() {
                    if !text.is_empty() {
                        text.push_str("\n\n");
                    }
                    text.push_str(IMAGES_HEADER);
                    text.push('\n');
                    text.push_str(&descriptions.join("\n\n"));
                }
                unit_meta.insert("images_described".into(), descriptions.len().into());
                if failed > 0 {
                    unit_meta.insert("images_failed".into(), failed.into());
                }
                unit_meta.insert("vision_model".into(), vision.model_name().into());
            }

            let mut unit = ExtractedUnit::new(text)
                .with_meta("extractor", self.name())
                .with_meta("format", request.extension.as_str());
            unit.metadata.extend(unit_meta);
            units.push(unit);
        }

        debug!(
            stage = "office_extracted",
            filename = %request.filename,
            units = units.len(),
            "Extracted office document"
        );
        Ok(units)
    }
}

fn media_entries(archive: &ooxml::Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && is_image_type(&get_file_extension(n)))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

fn read_images(
    archive: &mut ooxml::Archive<'_>,
    names: Vec<String>,
    format: &str,
) -> Result<Vec<(String, Bytes)>, ExtractionError> {
    let mut images = Vec::new();
    for name in names {
        if let Some(bytes) =
            ooxml::read_optional_entry(archive, &name, ooxml::MAX_MEDIA_ENTRY_BYTES, format)?
        {
            images.push((name, Bytes::from(bytes)));
        }
    }
    Ok(images)
}

fn parse_docx(bytes: &[u8], with_images: bool) -> Result<Vec<OfficePart>, ExtractionError> {
    let mut archive = ooxml::open(bytes, "docx")?;
    let xml = ooxml::read_entry(
        &mut archive,
        "word/document.xml",
        ooxml::MAX_XML_ENTRY_BYTES,
        "docx",
    )?;
    let (text, paragraphs) = ooxml::paragraph_text(&xml, "docx")?;

    let images = if with_images {
        let names = media_entries(&archive, "word/media/");
        read_images(&mut archive, names, "docx")?
    } else {
        Vec::new()
    };

    let mut metadata = Map::new();
    metadata.insert("paragraph_count".into(), paragraphs.into());
    Ok(vec![OfficePart {
        text,
        metadata,
        images,
    }])
}

fn parse_pptx(bytes: &[u8], with_images: bool) -> Result<Vec<OfficePart>, ExtractionError> {
    let mut archive = ooxml::open(bytes, "pptx")?;
    let slides = ooxml::numbered_entries(&archive, "ppt/slides/slide", ".xml");
    let total = slides.len();

    let mut parts = Vec::with_capacity(total);
    for (idx, slide) in slides.iter().enumerate() {
        let xml = ooxml::read_entry(&mut archive, slide, ooxml::MAX_XML_ENTRY_BYTES, "pptx")?;
        let (body, _) = ooxml::paragraph_text(&xml, "pptx")?;

        let images = if with_images {
            slide_images(&mut archive, slide)?
        } else {
            Vec::new()
        };

        let number = idx + 1;
        let text = if body.is_empty() {
            String::new()
        } else {
            format!("Slide {number}\n{body}")
        };
        let mut metadata = Map::new();
        metadata.insert("slide_number".into(), number.into());
        metadata.insert("total_slides".into(), total.into());
        parts.push(OfficePart {
            text,
            metadata,
            images,
        });
    }
    Ok(parts)
}

/// Images referenced from one slide's relationship part.
fn slide_images(
    archive: &mut ooxml::Archive<'_>,
    slide: &str,
) -> Result<Vec<(String, Bytes)>, ExtractionError> {
    let (dir, file) = slide.rsplit_once('/').unwrap_or(("", slide));
    let rels_name = format!("{dir}/_rels/{file}.rels");
    let Some(rels) =
        ooxml::read_optional_entry(archive, &rels_name, ooxml::MAX_XML_ENTRY_BYTES, "pptx")?
    else {
        return Ok(Vec::new());
    };

    let mut names: Vec<String> = ooxml::relationships(&rels, "pptx")?
        .into_iter()
        .filter(ooxml::Relationship::is_image)
        .map(|rel| ooxml::resolve_target(dir, &rel.target))
        .filter(|name| is_image_type(&get_file_extension(name)))
        .collect();
    names.dedup();
    read_images(archive, names, "pptx")
}
