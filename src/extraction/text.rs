//! Plain text extraction with encoding probing.

use async_trait::async_trait;

use super::{ExtractedUnit, ExtractionError, ExtractionRequest, Extractor};

/// Encodings tried in order. The first that decodes to non-empty text wins.
const ENCODINGS: &[&str] = &[
    "utf-8",
    "utf-8-sig",
    "utf-16",
    "utf-16-le",
    "utf-16-be",
    "latin-1",
    "windows-1252",
];

/// Windows-1252 code points for bytes 0x80..=0x9F. `None` marks undefined bytes.
const WINDOWS_1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), None, Some('\u{201A}'), Some('\u{0192}'),
    Some('\u{201E}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02C6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None, Some('\u{017D}'), None,
    None, Some('\u{2018}'), Some('\u{2019}'), Some('\u{201C}'),
    Some('\u{201D}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02DC}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203A}'),
    Some('\u{0153}'), None, Some('\u{017E}'), Some('\u{0178}'),
];

/// Decode bytes by probing [`ENCODINGS`] in order.
///
/// Returns the text and the name of the encoding that produced it, or the
/// list of attempted encodings when none succeeds.
pub fn decode_text(bytes: &[u8]) -> Result<(String, &'static str), ExtractionError> {
    for &encoding in ENCODINGS {
        if let Some(text) = decode_with(bytes, encoding)
            && !text.is_empty()
        {
            return Ok((text, encoding));
        }
    }
    Err(ExtractionError::Encoding {
        attempted: ENCODINGS.iter().map(|e| e.to_string()).collect(),
    })
}

fn decode_with(bytes: &[u8], encoding: &str) -> Option<String> {
    match encoding {
        // NUL bytes mean a wide encoding, not UTF-8 text.
        "utf-8" | "utf-8-sig" if bytes.contains(&0) => None,
        "utf-8" => {
            if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
                return None;
            }
            std::str::from_utf8(bytes).ok().map(str::to_string)
        }
        "utf-8-sig" => bytes
            .strip_prefix(&[0xEF, 0xBB, 0xBF])
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .map(str::to_string),
        "utf-16" => {
            if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
                decode_utf16(rest, u16::from_le_bytes)
            } else if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
                decode_utf16(rest, u16::from_be_bytes)
            } else {
                None
            }
        }
        // Without a BOM, only accept input that looks like UTF-16 text: ASCII
        // characters leave a NUL in every other byte.
        "utf-16-le" if looks_like_utf16(bytes, 1) => decode_utf16(bytes, u16::from_le_bytes),
        "utf-16-be" if looks_like_utf16(bytes, 0) => decode_utf16(bytes, u16::from_be_bytes),
        "latin-1" => {
            // C1 controls and NUL are not text; leave them to windows-1252.
            if bytes.iter().any(|&b| b == 0 || (0x80..=0x9F).contains(&b)) {
                return None;
            }
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        "windows-1252" => bytes
            .iter()
            .map(|&b| match b {
                0 => None,
                0x80..=0x9F => WINDOWS_1252_HIGH[(b - 0x80) as usize],
                _ => Some(b as char),
            })
            .collect(),
        _ => None,
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn looks_like_utf16(bytes: &[u8], nul_offset: usize) -> bool {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return false;
    }
    let pairs = bytes.len() / 2;
    let nuls = bytes
        .chunks_exact(2)
        .filter(|pair| pair[nul_offset] == 0 && pair[1 - nul_offset] != 0)
        .count();
    nuls * 10 >= pairs * 3
}

/// Extracts `.txt` and `.md` files as a single unit.
#[derive(Debug, Default)]
pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_handle(&self, extension: &str) -> bool {
        matches!(extension, "txt" | "md")
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }
        let (text, encoding) = decode_text(&request.bytes)?;
        let text = text.replace("\r\n", "\n");
        Ok(vec![
            ExtractedUnit::new(text)
                .with_meta("encoding", encoding)
                .with_meta("extractor", self.name()),
        ])
    }
}
