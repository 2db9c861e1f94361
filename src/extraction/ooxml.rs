//! ZIP and XML plumbing shared by the OOXML extractors (docx, pptx, xlsx).

use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};

use super::ExtractionError;

/// Maximum decompressed bytes read from one XML part (zip-bomb protection).
pub(super) const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Maximum decompressed bytes read from one embedded media file.
pub(super) const MAX_MEDIA_ENTRY_BYTES: u64 = 20 * 1024 * 1024;

pub(super) type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

pub(super) fn open<'a>(bytes: &'a [u8], format: &str) -> Result<Archive<'a>, ExtractionError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractionError::corrupted(format, e))
}

/// Read a named entry, failing if it is missing or larger than `max_bytes`.
pub(super) fn read_entry(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
    format: &str,
) -> Result<Vec<u8>, ExtractionError> {
    read_optional_entry(archive, name, max_bytes, format)?
        .ok_or_else(|| ExtractionError::corrupted(format, format!("{name} not found")))
}

/// Like [`read_entry`], but a missing entry is `Ok(None)`.
pub(super) fn read_optional_entry(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
    format: &str,
) -> Result<Option<Vec<u8>>, ExtractionError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractionError::corrupted(format, e)),
    };
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::corrupted(format, e))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractionError::corrupted(
            format,
            format!("{name} exceeds size limit ({max_bytes} bytes)"),
        ));
    }
    Ok(Some(out))
}

/// Entries named `{prefix}{n}{suffix}`, sorted by `n`.
pub(super) fn numbered_entries(archive: &Archive<'_>, prefix: &str, suffix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

/// Value of an attribute by local name.
pub(super) fn attr(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Text of every `<*:t>` run, with a newline at each paragraph end.
///
/// Works for both WordprocessingML (`w:t`, `w:p`) and DrawingML (`a:t`,
/// `a:p`). Returns the text and the number of non-empty paragraphs.
pub(super) fn paragraph_text(xml: &[u8], format: &str) -> Result<(String, usize), ExtractionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut paragraph = String::new();
    let mut paragraphs = 0;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractionError::corrupted(format, e))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => paragraph.push('\t'),
                b"br" | b"cr" => paragraph.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = paragraph.trim_end();
                    if !line.is_empty() {
                        out.push_str(line);
                        out.push('\n');
                        paragraphs += 1;
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::corrupted(format, e)),
            _ => {}
        }
        buf.clear();
    }

    // Runs outside any paragraph element
    let tail = paragraph.trim_end();
    if !tail.is_empty() {
        out.push_str(tail);
        paragraphs += 1;
    }
    Ok((out.trim_end().to_string(), paragraphs))
}

/// One `<Relationship>` from a `.rels` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Relationship {
    pub id: String,
    pub kind: String,
    pub target: String,
}

impl Relationship {
    pub fn is_image(&self) -> bool {
        self.kind.ends_with("/image")
    }
}

pub(super) fn relationships(
    xml: &[u8],
    format: &str,
) -> Result<Vec<Relationship>, ExtractionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    out.push(Relationship {
                        id,
                        kind: attr(&e, b"Type").unwrap_or_default(),
                        target,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::corrupted(format, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Resolve a relationship target against the directory of its source part.
///
/// `resolve_target("ppt/slides", "../media/image1.png")` is
/// `"ppt/media/image1.png"`. Absolute targets (`/ppt/...`) drop the slash.
pub(super) fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            ".." => {
                parts.pop();
            }
            "." | "" => {}
            other => parts.push(other),
        }
    }
    parts.join("/")
}
