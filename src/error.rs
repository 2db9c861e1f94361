//! Surfaced error object for ingestion failures.
//!
//! Every hard failure that reaches a caller is a [`ProcessingError`] with a
//! fixed category. Categories split into user errors, which are never
//! retried or downgraded, and system errors, which are only surfaced after
//! every fallback has been exhausted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fixed set of failure categories reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    EmptyContent,
    EncodingError,
    CorruptedFile,
    UnsupportedFormat,
    InsufficientContent,
    ProcessingError,
    ValidationError,
    FileNotFound,
    PermissionError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyContent => "EmptyContent",
            Self::EncodingError => "EncodingError",
            Self::CorruptedFile => "CorruptedFile",
            Self::UnsupportedFormat => "UnsupportedFormat",
            Self::InsufficientContent => "InsufficientContent",
            Self::ProcessingError => "ProcessingError",
            Self::ValidationError => "ValidationError",
            Self::FileNotFound => "FileNotFound",
            Self::PermissionError => "PermissionError",
        }
    }

    /// Only internal processing failures count as system errors.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ProcessingError => ErrorType::SystemError,
            _ => ErrorType::UserError,
        }
    }

    /// Terminal categories propagate unchanged from the primary extractor
    /// instead of handing off to the fallback chain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EmptyContent | Self::UnsupportedFormat)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UserError,
    SystemError,
}

/// Error object returned when an ingestion call fails outright.
///
/// Serializes to `{ error, error_category, error_type, details }`.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{error_category}: {error}")]
pub struct ProcessingError {
    pub error: String,
    pub error_category: ErrorCategory,
    pub error_type: ErrorType,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ProcessingError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            error_category: category,
            error_type: category.error_type(),
            details: Map::new(),
        }
    }

    /// Attach a diagnostic detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn empty_content(filename: &str) -> Self {
        Self::new(
            ErrorCategory::EmptyContent,
            format!("File '{filename}' is empty"),
        )
        .with_detail("filename", filename)
    }

    pub fn unsupported_format(extension: &str) -> Self {
        Self::new(
            ErrorCategory::UnsupportedFormat,
            format!("File type '{extension}' is not supported"),
        )
        .with_detail("extension", extension)
    }

    pub fn insufficient_content(chars: usize, minimum: usize) -> Self {
        Self::new(
            ErrorCategory::InsufficientContent,
            format!("Extracted content has {chars} characters, minimum is {minimum}"),
        )
        .with_detail("characters", chars)
        .with_detail("minimum", minimum)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ValidationError, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ProcessingError, message)
    }

    pub fn is_user_error(&self) -> bool {
        self.error_type == ErrorType::UserError
    }

    pub fn is_terminal(&self) -> bool {
        self.error_category.is_terminal()
    }
}
