//! PDF text extraction.
//!
//! [`PdfTextExtractor`] is the fallback: whole-document text through
//! `pdf-extract`. The page-level helpers here back the smart extractor,
//! which needs per-page text to measure density and single-page documents
//! to hand to the vision capability.

use async_trait::async_trait;
use lopdf::Document;

use super::{ExtractedUnit, ExtractionError, ExtractionRequest, Extractor, run_blocking};

#[derive(Debug, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl Extractor for PdfTextExtractor {
    fn name(&self) -> &'static str {
        "pdf_text"
    }

    fn can_handle(&self, extension: &str) -> bool {
        extension == "pdf"
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }
        let bytes = request.bytes.clone();
        let text = run_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| ExtractionError::corrupted("pdf", e))
        })
        .await?;

        Ok(vec![
            ExtractedUnit::new(text.trim())
                .with_meta("extractor", self.name())
                .with_meta("content_type", "text"),
        ])
    }
}

pub(super) fn load(bytes: &[u8]) -> Result<Document, ExtractionError> {
    let doc = Document::load_mem(bytes).map_err(|e| ExtractionError::corrupted("pdf", e))?;
    if doc.is_encrypted() {
        return Err(ExtractionError::corrupted("pdf", "document is encrypted"));
    }
    Ok(doc)
}

/// Text of every page, keyed by 1-based page number. Unreadable pages are empty.
pub(super) fn page_texts(doc: &Document) -> Vec<(u32, String)> {
    doc.get_pages()
        .into_keys()
        .map(|page| {
            let text = doc.extract_text(&[page]).unwrap_or_else(|e| {
                tracing::debug!(page, error = %e, "Page text extraction failed");
                String::new()
            });
            (page, text.trim().to_string())
        })
        .collect()
}

/// A copy of the document that keeps only `page`.
pub(super) fn single_page(doc: &Document, page: u32) -> Result<Vec<u8>, ExtractionError> {
    let mut copy = doc.clone();
    let others: Vec<u32> = copy.get_pages().into_keys().filter(|&p| p != page).collect();
    copy.delete_pages(&others);
    copy.prune_objects();
    let mut out = Vec::new();
    copy.save_to(&mut out)
        .map_err(|e| ExtractionError::corrupted("pdf", e))?;
    Ok(out)
}

/// Build a PDF with one text line per page.
#[cfg(test)]
pub(crate) fn sample_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::{
        Object, Stream,
        content::{Content, Operation},
        dictionary,
    };

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}
