//! Content validation for extracted units.
//!
//! [`ContentValidator::validate`] is a pure function of the units and the
//! file extension. It runs a fixed failure ladder (first match wins) and,
//! for content that passes, appends non-fatal warnings:
//!
//! | Check | Outcome |
//! |---|---|
//! | zero units | [`ValidationFailure::NoDocuments`] |
//! | every unit empty | [`ValidationFailure::EmptyContent`] |
//! | whitespace only | [`ValidationFailure::WhitespaceOnly`] |
//! | fewer than `min_chars` characters | [`ValidationFailure::InsufficientContent`] |
//! | low character count, mostly empty units, short units | warning |
//! | format-specific heuristics | warning |

use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorCategory, ProcessingError},
    extraction::{ExtractedUnit, IMAGE_PLACEHOLDER_PREFIX, is_image_type},
};

/// Default minimum number of characters for valid content.
pub const DEFAULT_MIN_CHARS: usize = 10;

/// Passing content below this many characters gets a warning.
const LOW_CONTENT_CHARS: usize = 50;

/// Average characters per unit below which units look fragmented.
const LOW_AVERAGE_UNIT_CHARS: f64 = 20.0;

/// Why content was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationFailure {
    NoDocuments,
    EmptyContent,
    WhitespaceOnly,
    InsufficientContent { characters: usize, minimum: usize },
}

impl ValidationFailure {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoDocuments | Self::EmptyContent | Self::WhitespaceOnly => {
                ErrorCategory::EmptyContent
            }
            Self::InsufficientContent { .. } => ErrorCategory::InsufficientContent,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NoDocuments => "No content could be extracted from the file".to_string(),
            Self::EmptyContent => "All extracted sections are empty".to_string(),
            Self::WhitespaceOnly => "Extracted content contains only whitespace".to_string(),
            Self::InsufficientContent {
                characters,
                minimum,
            } => format!(
                "Extracted content has {characters} characters, minimum is {minimum}"
            ),
        }
    }

    pub fn to_error(&self, filename: &str) -> ProcessingError {
        let error = match self {
            Self::InsufficientContent {
                characters,
                minimum,
            } => ProcessingError::insufficient_content(*characters, *minimum),
            _ => ProcessingError::new(self.category(), self.message()),
        };
        error
            .with_detail("filename", filename)
            .with_detail("validation_failure", format!("{self:?}"))
    }
}

/// Statistics over the extracted units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentStats {
    pub unit_count: usize,
    pub units_with_content: usize,
    pub empty_units: usize,
    /// Characters after trimming each unit.
    pub total_chars: usize,
    pub total_words: usize,
    pub non_whitespace_chars: usize,
    pub min_unit_length: usize,
    pub max_unit_length: usize,
    pub average_unit_length: f64,
}

impl ContentStats {
    pub fn compute(units: &[ExtractedUnit]) -> Self {
        let lengths: Vec<usize> = units.iter().map(|u| u.text.trim().chars().count()).collect();
        let total_chars: usize = lengths.iter().sum();
        let units_with_content = lengths.iter().filter(|&&len| len > 0).count();
        let unit_count = units.len();

        Self {
            unit_count,
            units_with_content,
            empty_units: unit_count - units_with_content,
            total_chars,
            total_words: units.iter().map(|u| u.text.split_whitespace().count()).sum(),
            non_whitespace_chars: units
                .iter()
                .map(|u| u.text.chars().filter(|c| !c.is_whitespace()).count())
                .sum(),
            min_unit_length: lengths.iter().copied().min().unwrap_or(0),
            max_unit_length: lengths.iter().copied().max().unwrap_or(0),
            average_unit_length: if unit_count == 0 {
                0.0
            } else {
                total_chars as f64 / unit_count as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub failure: Option<ValidationFailure>,
    pub warnings: Vec<String>,
    pub stats: ContentStats,
}

impl ValidationResult {
    /// The surfaced error for a rejected result.
    pub fn error(&self, filename: &str) -> Option<ProcessingError> {
        self.failure.as_ref().map(|f| f.to_error(filename))
    }
}

#[derive(Debug, Clone)]
pub struct ContentValidator {
    min_chars: usize,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHARS)
    }
}

impl ContentValidator {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }

    pub fn validate(&self, units: &[ExtractedUnit], extension: &str) -> ValidationResult {
        let stats = ContentStats::compute(units);

        let failure = if stats.unit_count == 0 {
            Some(ValidationFailure::NoDocuments)
        } else if units.iter().all(|u| u.text.is_empty()) {
            Some(ValidationFailure::EmptyContent)
        } else if stats.non_whitespace_chars == 0 {
            Some(ValidationFailure::WhitespaceOnly)
        } else if stats.total_chars < self.min_chars {
            Some(ValidationFailure::InsufficientContent {
                characters: stats.total_chars,
                minimum: self.min_chars,
            })
        } else {
            None
        };

        if let Some(failure) = failure {
            return ValidationResult {
                valid: false,
                failure: Some(failure),
                warnings: Vec::new(),
                stats,
            };
        }

        let mut warnings = general_warnings(&stats);
        warnings.extend(format_warnings(units, extension));
        ValidationResult {
            valid: true,
            failure: None,
            warnings,
            stats,
        }
    }
}

fn general_warnings(stats: &ContentStats) -> Vec<String> {
    let mut warnings = Vec::new();
    if stats.total_chars < LOW_CONTENT_CHARS {
        warnings.push(format!(
            "Very little content extracted ({} characters)",
            stats.total_chars
        ));
    }
    if stats.empty_units * 2 > stats.unit_count {
        warnings.push(format!(
            "Most sections are empty ({} of {})",
            stats.empty_units, stats.unit_count
        ));
    }
    if stats.unit_count > 1 && stats.average_unit_length < LOW_AVERAGE_UNIT_CHARS {
        warnings.push(format!(
            "Low average content per section ({:.1} characters)",
            stats.average_unit_length
        ));
    }
    warnings
}

fn format_warnings(units: &[ExtractedUnit], extension: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    match extension {
        "sdf" | "mol" => {
            if !units.iter().any(|u| u.text.contains("Formula:")) {
                warnings.push("No recognizable molecular fields found".to_string());
            }
        }
        "csv" | "xlsx" => {
            let header_only = units.iter().all(|u| {
                u.metadata
                    .get("row_count")
                    .and_then(|v| v.as_u64())
                    .is_some_and(|rows| rows == 0)
            });
            if header_only {
                warnings.push("Spreadsheet appears to contain only a header row".to_string());
            }
        }
        "pdf" => {
            let failed = units
                .iter()
                .filter(|u| u.meta_str("extraction_method") == Some("vision_failed"))
                .count();
            if failed > 0 {
                warnings.push(format!("Vision analysis failed for {failed} page(s)"));
            }
        }
        ext if is_image_type(ext) => {
            let recognized = units.iter().any(|u| {
                u.text.trim_start().starts_with(IMAGE_PLACEHOLDER_PREFIX)
                    || u.metadata.contains_key("vision_model")
            });
            if !recognized {
                warnings.push("Image content lacks the expected image marker".to_string());
            }
        }
        _ => {}
    }
    warnings
}
