use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::OwnerScope;
use crate::{error::ProcessingError, extraction::ExtractionMode};

/// An upload, alive for the duration of one ingestion call.
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Bytes,
    pub filename: String,
    pub scope: OwnerScope,
    /// Extra instructions forwarded to the vision capability.
    pub prompt: Option<String>,
    /// Extraction depth; the configured default applies when unset.
    pub mode: Option<ExtractionMode>,
}

impl Document {
    pub fn new(bytes: impl Into<Bytes>, filename: impl Into<String>, scope: OwnerScope) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
            scope,
            prompt: None,
            mode: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    /// Lower-cased extension.
    pub format: String,
    pub size_bytes: u64,
    /// Extracted characters across all units.
    pub content_length: usize,
    pub encoding: Option<String>,
}

/// Outcome of an ingestion call. Always returned, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    /// True iff at least one chunk was stored.
    pub success: bool,
    pub message: String,
    /// Chunks stored successfully.
    pub chunk_count: usize,
    /// Seconds spent in the call.
    pub processing_time: Option<f64>,
    pub errors: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
    pub file_info: FileInfo,
}

impl IngestionResult {
    /// Result for a call that failed before any chunk was stored.
    pub fn failed(error: &ProcessingError, file_info: FileInfo, processing_time: f64) -> Self {
        Self {
            success: false,
            message: error.error.clone(),
            chunk_count: 0,
            processing_time: Some(processing_time),
            errors: Some(vec![error.to_string()]),
            warnings: None,
            file_info,
        }
    }
}

pub(crate) fn non_empty(list: Vec<String>) -> Option<Vec<String>> {
    if list.is_empty() { None } else { Some(list) }
}
