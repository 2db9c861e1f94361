//! Document extraction: format routing, per-format extractors and the
//! vision-capable primary extractor.
//!
//! # Supported extensions
//!
//! | Category | Extensions | Extractor |
//! |---|---|---|
//! | Plain text | `txt`, `md` | [`TextExtractor`] (encoding probing) |
//! | Office | `docx`, `pptx` | [`OfficeExtractor`] |
//! | Spreadsheet | `xlsx`, `csv` | [`SpreadsheetExtractor`] |
//! | Chemical structure | `sdf`, `mol` | [`ChemistryExtractor`] |
//! | Image | `png`, `jpg`, `jpeg`, `gif`, `bmp`, `webp` | [`ImageExtractor`] (placeholder) |
//! | PDF | `pdf` | [`PdfTextExtractor`] |
//!
//! The [`SmartExtractor`] runs first for every file. It sends scanned PDF
//! pages, raster images and embedded office images through a
//! [`VisionAnalyzer`] and streams PDF pages as they are produced. On any
//! non-terminal failure the [`FormatRouter`] fallback chain is tried.

mod chemistry;
mod image;
mod office;
mod ooxml;
pub(crate) mod pdf;
pub mod rate_limit;
mod registry;
mod smart;
mod spreadsheet;
mod text;
pub mod vision;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use chemistry::{
    ChemistryExtractor, LenientMolParser, Molecule, MoleculeParser, StrictMolParser,
};
pub use image::{IMAGE_PLACEHOLDER_PREFIX, ImageExtractor};
pub use office::OfficeExtractor;
pub use pdf::PdfTextExtractor;
pub use rate_limit::TokenBucket;
pub use registry::FormatRouter;
pub use smart::SmartExtractor;
pub use spreadsheet::SpreadsheetExtractor;
pub use text::{TextExtractor, decode_text};
pub use vision::{VisionAnalyzer, VisionError, VisionInput};

use crate::error::{ErrorCategory, ProcessingError};

/// Every extension accepted for ingestion, lower-case.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "docx", "pptx", "xlsx", "csv", "png", "jpg", "jpeg", "gif", "bmp",
    "webp", "sdf", "mol",
];

/// Lower-cased extension of a filename (text after the last dot), or an
/// empty string when the final path component has no dot.
pub fn get_file_extension(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

/// Check if an extension (already lower-cased) can be ingested.
pub fn is_supported_file_type(extension: &str) -> bool {
    matches!(
        extension,
        "pdf" | "txt" | "md" |
        "docx" | "pptx" |
        "xlsx" | "csv" |
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" |
        "sdf" | "mol"
    )
}

pub(crate) fn is_image_type(extension: &str) -> bool {
    matches!(
        extension,
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp"
    )
}

pub(crate) fn image_mime(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Extraction depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Vision only for scanned PDF pages, raster images and slide images.
    #[default]
    Fast,
    /// Vision for every PDF page and every embedded office image.
    Detailed,
}

/// One normalized text segment: a page, sheet, slide or structure record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedUnit {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl ExtractedUnit {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Input handed to an extractor.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub bytes: Bytes,
    pub filename: String,
    pub extension: String,
    pub mode: ExtractionMode,
    pub prompt: Option<String>,
}

impl ExtractionRequest {
    pub fn new(bytes: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            bytes: bytes.into(),
            extension: get_file_extension(&filename),
            filename,
            mode: ExtractionMode::default(),
            prompt: None,
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self
    }
}

/// Units emitted progressively by a streaming extractor.
pub type UnitStream = BoxStream<'static, Result<ExtractedUnit, ExtractionError>>;

/// Errors that can occur during extraction.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("File '{0}' is empty")]
    Empty(String),

    #[error("File type '{0}' is not supported")]
    UnsupportedFormat(String),

    #[error("Could not decode text; attempted encodings: {}", .attempted.join(", "))]
    Encoding { attempted: Vec<String> },

    #[error("Corrupted {format} file: {message}")]
    Corrupted { format: String, message: String },

    #[error("No valid records in {total} parsed ({malformed} malformed)")]
    NoValidRecords { total: usize, malformed: usize },

    #[error("Vision analysis is not configured")]
    VisionUnavailable,

    #[error("Vision analysis failed: {0}")]
    Vision(String),

    #[error("Extraction failed: {0}")]
    Internal(String),
}

impl ExtractionError {
    pub fn corrupted(format: &str, message: impl std::fmt::Display) -> Self {
        Self::Corrupted {
            format: format.to_string(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Empty(_) => ErrorCategory::EmptyContent,
            Self::UnsupportedFormat(_) => ErrorCategory::UnsupportedFormat,
            Self::Encoding { .. } => ErrorCategory::EncodingError,
            Self::Corrupted { .. } | Self::NoValidRecords { .. } => ErrorCategory::CorruptedFile,
            Self::VisionUnavailable | Self::Vision(_) | Self::Internal(_) => {
                ErrorCategory::ProcessingError
            }
        }
    }

    /// Terminal errors are not handed to the fallback chain.
    pub fn is_terminal(&self) -> bool {
        self.category().is_terminal()
    }
}

impl From<ExtractionError> for ProcessingError {
    fn from(err: ExtractionError) -> Self {
        let mut out = ProcessingError::new(err.category(), err.to_string());
        match &err {
            ExtractionError::Encoding { attempted } => {
                out = out.with_detail("attempted_encodings", attempted.clone());
            }
            ExtractionError::NoValidRecords { total, malformed } => {
                out = out
                    .with_detail("total_records", *total)
                    .with_detail("malformed_records", *malformed);
            }
            ExtractionError::Corrupted { format, .. } => {
                out = out.with_detail("format", format.clone());
            }
            _ => {}
        }
        out
    }
}

/// A format-specific extraction strategy.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name used in logs and unit metadata.
    fn name(&self) -> &'static str;

    /// Whether this extractor handles the (lower-cased) extension.
    fn can_handle(&self, extension: &str) -> bool;

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError>;
}

/// Run a blocking parser off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ExtractionError>
where
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExtractionError::Internal(format!("extraction task failed: {e}")))?
}

/// Build an in-memory ZIP archive from `(name, contents)` pairs.
#[cfg(test)]
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, contents) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}
