//! Overlapping text windows.
//!
//! Each unit is cut into windows of at most `chunk_size` characters. A cut
//! prefers, in order, a paragraph break, a line break, a sentence end, a
//! word boundary, and finally a hard cut; the search runs backward from the
//! ideal cut point but never below half a window. The last `chunk_overlap`
//! characters of a window open the next one.

use serde_json::{Map, Value};

use crate::{config::ChunkingConfig, extraction::ExtractedUnit, models::OwnerScope};

/// A chunk before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    /// Position across the whole document.
    pub index: usize,
    pub content: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            size: config.chunk_size.max(1),
            overlap: config.chunk_overlap.min(config.chunk_size.saturating_sub(1)),
        }
    }

    /// `(start, end)` character ranges for one text.
    pub fn windows(&self, text: &str) -> Vec<(usize, usize)> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        if chars.iter().all(|c| c.is_whitespace()) {
            return Vec::new();
        }
        if len <= self.size {
            return vec![(0, len)];
        }

        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.size).min(len);
            if end == len {
                windows.push((start, len));
                break;
            }
            let cut = find_cut(&chars, start, end, self.size);
            windows.push((start, cut));
            start = cut.saturating_sub(self.overlap).max(start + 1);
        }
        windows
    }

    /// Chunk one unit. `first_index` is the document-wide index of the first chunk.
    pub fn chunk_unit(
        &self,
        unit: &ExtractedUnit,
        filename: &str,
        scope: &OwnerScope,
        first_index: usize,
    ) -> Vec<ChunkDraft> {
        let chars: Vec<char> = unit.text.chars().collect();
        // Blank windows are dropped before numbering so indices stay contiguous.
        self.windows(&unit.text)
            .into_iter()
            .filter_map(|(start, end)| {
                let content: String = chars[start..end].iter().collect();
                (!content.trim().is_empty()).then_some((start, end, content))
            })
            .enumerate()
            .map(|(i, (start, end, content))| {
                let mut metadata = unit.metadata.clone();
                metadata.insert("chunk_index".into(), (first_index + i).into());
                metadata.insert("char_start".into(), start.into());
                metadata.insert("char_end".into(), end.into());
                metadata.insert("filename".into(), filename.into());
                metadata.insert("user_id".into(), scope.user_id.clone().into());
                metadata.insert("conversation_id".into(), scope.conversation_id.clone().into());
                ChunkDraft {
                    index: first_index + i,
                    content,
                    metadata,
                }
            })
            .collect()
    }

    /// Chunk every unit, numbering chunks across the document.
    pub fn chunk_units(
        &self,
        units: &[ExtractedUnit],
        filename: &str,
        scope: &OwnerScope,
    ) -> Vec<ChunkDraft> {
        let mut drafts = Vec::new();
        for unit in units {
            let next = drafts.len();
            drafts.extend(self.chunk_unit(unit, filename, scope, next));
        }
        drafts
    }
}

fn find_cut(chars: &[char], start: usize, end: usize, size: usize) -> usize {
    let floor = start + size / 2;
    let range = || (floor.max(start + 1)..end).rev();

    let paragraph = range().find(|&i| chars[i] == '\n' && chars[i - 1] == '\n');
    let line = || range().find(|&i| chars[i] == '\n');
    let sentence = || {
        range().find(|&i| matches!(chars[i - 1], '.' | '!' | '?') && chars[i].is_whitespace())
    };
    let word = || range().find(|&i| chars[i].is_whitespace());

    // Cut after the boundary character so it stays with the left window.
    paragraph
        .or_else(line)
        .or_else(sentence)
        .or_else(word)
        .map(|i| i + 1)
        .unwrap_or(end)
}
