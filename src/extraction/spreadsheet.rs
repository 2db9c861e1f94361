//! Spreadsheet extraction: one unit per sheet, rows as `column: value` pairs.

use std::collections::HashMap;

use async_trait::async_trait;
use quick_xml::events::Event;
use tracing::debug;

use super::{
    ExtractedUnit, ExtractionError, ExtractionRequest, Extractor, decode_text, ooxml,
    run_blocking,
};

/// Maximum sheets read from one workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// A parsed sheet: first non-empty row is the header.
#[derive(Debug, Default)]
struct Table {
    name: String,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Render as text. Returns `None` for a sheet with no cells.
    fn render(self, index: usize) -> Option<ExtractedUnit> {
        let mut rows = self.rows.into_iter().filter(|r| r.iter().any(|c| !c.is_empty()));
        let header_row = rows.next()?;
        let headers: Vec<String> = header_row
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if h.is_empty() {
                    format!("Column {}", i + 1)
                } else {
                    h.clone()
                }
            })
            .collect();

        let mut lines = vec![
            format!("Sheet: {}", self.name),
            format!("Columns: {}", headers.join(", ")),
        ];
        let mut row_count = 0;
        for row in rows {
            let pairs: Vec<String> = row
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_empty())
                .map(|(i, value)| {
                    let column = headers
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("Column {}", i + 1));
                    format!("{column}: {value}")
                })
                .collect();
            if pairs.is_empty() {
                continue;
            }
            row_count += 1;
            lines.push(pairs.join("; "));
        }

        Some(
            ExtractedUnit::new(lines.join("\n"))
                .with_meta("sheet_name", self.name)
                .with_meta("sheet_index", index)
                .with_meta("row_count", row_count)
                .with_meta("columns", headers),
        )
    }
}

#[derive(Debug, Default)]
pub struct SpreadsheetExtractor;

#[async_trait]
impl Extractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn can_handle(&self, extension: &str) -> bool {
        matches!(extension, "xlsx" | "csv")
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedUnit>, ExtractionError> {
        if request.bytes.is_empty() {
            return Err(ExtractionError::Empty(request.filename.clone()));
        }

        let bytes = request.bytes.clone();
        let filename = request.filename.clone();
        let (tables, encoding) = match request.extension.as_str() {
            "xlsx" => (run_blocking(move || parse_xlsx(&bytes)).await?, None),
            "csv" => {
                let (text, encoding) = decode_text(&bytes)?;
                (vec![parse_csv(&text, &filename)?], Some(encoding))
            }
            other => return Err(ExtractionError::UnsupportedFormat(other.to_string())),
        };

        let units = tables
            .into_iter()
            .enumerate()
            .filter_map(|(i, table)| table.render(i))
            .map(|unit| {
                let unit = unit.with_meta("extractor", self.name());
                match encoding {
                    Some(encoding) => unit.with_meta("encoding", encoding),
                    None => unit,
                }
            })
            .collect();
        Ok(units)
    }
}

/// Pick the delimiter that appears most often in the first line.
fn sniff_delimiter(text: &str) -> u8 {
    let first = text.lines().next().unwrap_or_default();
    [b',', b';', b'\t', b'|']
        .into_iter()
        .max_by_key(|d| first.bytes().filter(|b| b == d).count())
        .filter(|d| first.as_bytes().contains(d))
        .unwrap_or(b',')
}

fn parse_csv(text: &str, filename: &str) -> Result<Table, ExtractionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(text))
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractionError::corrupted("csv", e))?;
        rows.push(record.iter().map(|v| v.trim().to_string()).collect());
    }
    Ok(Table {
        name: filename.to_string(),
        rows,
    })
}

fn parse_xlsx(bytes: &[u8]) -> Result<Vec<Table>, ExtractionError> {
    let mut archive = ooxml::open(bytes, "xlsx")?;
    let shared = match ooxml::read_optional_entry(
        &mut archive,
        "xl/sharedStrings.xml",
        ooxml::MAX_XML_ENTRY_BYTES,
        "xlsx",
    )? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut tables = Vec::new();
    for (name, part) in sheet_parts(&mut archive)?.into_iter().take(XLSX_MAX_SHEETS) {
        let Some(xml) =
            ooxml::read_optional_entry(&mut archive, &part, ooxml::MAX_XML_ENTRY_BYTES, "xlsx")?
        else {
            tracing::warn!(sheet = %name, part = %part, "Worksheet part missing, skipping");
            continue;
        };
        tables.push(Table {
            name,
            rows: sheet_rows(&xml, &shared)?,
        });
    }
    Ok(tables)
}

/// `(sheet name, part path)` in workbook order.
///
/// Names come from `xl/workbook.xml` resolved through its relationships.
/// Without a workbook, worksheet parts are listed by number.
fn sheet_parts(archive: &mut ooxml::Archive<'_>) -> Result<Vec<(String, String)>, ExtractionError> {
    let workbook =
        ooxml::read_optional_entry(archive, "xl/workbook.xml", ooxml::MAX_XML_ENTRY_BYTES, "xlsx")?;
    let rels = ooxml::read_optional_entry(
        archive,
        "xl/_rels/workbook.xml.rels",
        ooxml::MAX_XML_ENTRY_BYTES,
        "xlsx",
    )?;

    if let (Some(workbook), Some(rels)) = (workbook, rels) {
        let targets: HashMap<String, String> = ooxml::relationships(&rels, "xlsx")?
            .into_iter()
            .map(|rel| (rel.id, ooxml::resolve_target("xl", &rel.target)))
            .collect();

        let mut reader = quick_xml::Reader::from_reader(workbook.as_slice());
        let mut buf = Vec::new();
        let mut parts = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                    if let (Some(name), Some(id)) =
                        (ooxml::attr(&e, b"name"), ooxml::attr(&e, b"id"))
                        && let Some(target) = targets.get(&id)
                    {
                        parts.push((name, target.clone()));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(ExtractionError::corrupted("xlsx", e)),
                _ => {}
            }
            buf.clear();
        }
        if !parts.is_empty() {
            return Ok(parts);
        }
    }

    Ok(ooxml::numbered_entries(archive, "xl/worksheets/sheet", ".xml")
        .into_iter()
        .enumerate()
        .map(|(i, part)| (format!("Sheet{}", i + 1), part))
        .collect())
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    // Phonetic runs (<rPh>) repeat the text and are not part of the value.
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" if !in_phonetic => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractionError::corrupted("xlsx", e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::corrupted("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Highest column xlsx allows (`XFD`).
const XLSX_MAX_COLUMNS: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellRef {
    /// No `r` attribute, or no column letters in it.
    Missing,
    Column(usize),
    /// More than three letters or past `XFD`.
    OutOfRange,
}

/// Zero-based column from a cell reference such as `"AB12"`.
fn column_index(reference: &str) -> CellRef {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase())
        .collect();
    match letters.len() {
        0 => return CellRef::Missing,
        1..=3 => {}
        _ => return CellRef::OutOfRange,
    }
    let n = letters
        .iter()
        .fold(0usize, |acc, b| acc * 26 + usize::from(b - b'A' + 1));
    if n > XLSX_MAX_COLUMNS {
        CellRef::OutOfRange
    } else {
        CellRef::Column(n - 1)
    }
}

#[derive(Debug)]
struct CellState {
    column: CellRef,
    kind: Option<String>,
    value: String,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            column: CellRef::Missing,
            kind: None,
            value: String::new(),
        }
    }
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, ExtractionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = CellState::default();
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell = CellState {
                        column: ooxml::attr(&e, b"r")
                            .as_deref()
                            .map_or(CellRef::Missing, column_index),
                        kind: ooxml::attr(&e, b"t"),
                        value: String::new(),
                    };
                }
                // <v> holds the value; <t> holds inline strings
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                cell.value
                    .push_str(&te.unescape().map_err(|e| ExtractionError::corrupted("xlsx", e))?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let column = match cell.column {
                        CellRef::Column(column) => Some(column),
                        CellRef::Missing => Some(row.len()).filter(|&c| c < XLSX_MAX_COLUMNS),
                        CellRef::OutOfRange => None,
                    };
                    match column {
                        Some(column) => {
                            let value = resolve_cell(&cell, shared);
                            if row.len() <= column {
                                row.resize(column + 1, String::new());
                            }
                            row[column] = value;
                        }
                        None => debug!(stage = "cell_skipped", "Cell beyond column XFD skipped"),
                    }
                    cells += 1;
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::corrupted("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows)
}

fn resolve_cell(cell: &CellState, shared: &[String]) -> String {
    let raw = cell.value.trim();
    match cell.kind.as_deref() {
        Some("s") => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i))
            .cloned()
            .unwrap_or_default(),
        Some("b") => match raw {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        _ => raw.to_string(),
    }
}
