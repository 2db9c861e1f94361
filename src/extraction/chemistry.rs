//! Structured chemical-structure files (`.sdf`, `.mol`).
//!
//! A file is a sequence of records separated by `$$$$` lines. Each record
//! that parses becomes one unit with a readable summary. A record that does
//! not parse is counted and skipped; the file only fails when no record
//! parses at all.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ExtractedUnit, ExtractionError, ExtractionRequest, Extractor, decode_text};

const RECORD_DELIMITER: &str = "$$$$";

/// A parsed structure record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Molecule {
    pub name: Option<String>,
    /// Element symbol per atom, in file order.
    pub atoms: Vec<String>,
    /// `(from, to, order)` with 1-based atom indices.
    pub bonds: Vec<(usize, usize, u8)>,
    /// Data items declared as `> <NAME>` blocks.
    pub properties: Vec<(String, String)>,
}

impl Molecule {
    /// Hill-system formula over the explicit atoms.
    pub fn formula(&self) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for atom in &self.atoms {
            *counts.entry(atom.as_str()).or_default() += 1;
        }
        let mut out = String::new();
        let mut push = |symbol: &str, n: usize| {
            out.push_str(symbol);
            if n > 1 {
                out.push_str(&n.to_string());
            }
        };
        if let Some(c) = counts.remove("C") {
            push("C", c);
            if let Some(h) = counts.remove("H") {
                push("H", h);
            }
        }
        for (symbol, n) in counts {
            push(symbol, n);
        }
        out
    }

    /// Molecular weight in g/mol, or `None` if an element is not in the table.
    pub fn molecular_weight(&self) -> Option<f64> {
        self.atoms.iter().map(|a| atomic_weight(a)).sum()
    }

    /// Short hash of the bond graph, stable under atom renumbering of equal
    /// element/bond multisets.
    pub fn fingerprint(&self) -> String {
        let mut descriptors: Vec<String> = self
            .bonds
            .iter()
            .map(|&(a, b, order)| {
                let x = self.atoms.get(a.wrapping_sub(1)).map_or("?", String::as_str);
                let y = self.atoms.get(b.wrapping_sub(1)).map_or("?", String::as_str);
                let (x, y) = if x <= y { (x, y) } else { (y, x) };
                format!("{x}-{y}:{order}")
            })
            .collect();
        descriptors.sort();
        let mut hasher = Sha256::new();
        hasher.update(self.formula().as_bytes());
        for d in &descriptors {
            hasher.update(b"|");
            hasher.update(d.as_bytes());
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn summary(&self, fallback_name: &str) -> String {
        let mut lines = vec![
            format!("Molecule: {}", self.name.as_deref().unwrap_or(fallback_name)),
            format!("Formula: {}", self.formula()),
        ];
        if let Some(weight) = self.molecular_weight() {
            lines.push(format!("Molecular weight: {weight:.2} g/mol"));
        }
        lines.push(format!("Atoms: {}, Bonds: {}", self.atoms.len(), self.bonds.len()));
        lines.push(format!("Connectivity fingerprint: {}", self.fingerprint()));
        if !self.properties.is_empty() {
            lines.push("Properties:".to_string());
            for (key, value) in &self.properties {
                lines.push(format!("  {key}: {value}"));
            }
        }
        lines.join("\n")
    }
}

fn atomic_weight(symbol: &str) -> Option<f64> {
    Some(match symbol {
        "H" => 1.008,
        "D" => 2.014,
        "B" => 10.81,
        "C" => 12.011,
        "N" => 14.007,
        "O" => 15.999,
        "F" => 18.998,
        "Na" => 22.990,
        "Mg" => 24.305,
        "Al" => 26.982,
        "Si" => 28.085,
        "P" => 30.974,
        "S" => 32.06,
        "Cl" => 35.45,
        "K" => 39.098,
        "Ca" => 40.078,
        "Mn" => 54.938,
        "Fe" => 55.845,
        "Co" => 58.933,
        "Ni" => 58.693,
        "Cu" => 63.546,
        "Zn" => 65.38,
        "Se" => 78.971,
        "Br" => 79.904,
        "Li" => 6.94,
        "I" => 126.904,
        _ => return None,
    })
}

/// Parses one record (the text between delimiters).
pub trait MoleculeParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, record: &str) -> Result<Molecule, String>;
}

/// Split a record into the connection table and its `> <NAME>` data items.
fn split_properties(record: &str) -> (Vec<&str>, Vec<(String, String)>) {
    let mut table = Vec::new();
    let mut properties = Vec::new();
    let mut lines = record.lines().peekable();

    while let Some(line) = lines.next() {
        let header = line.trim_start();
        if header.starts_with('>')
            && let Some(start) = header.find('<')
            && let Some(len) = header[start + 1..].find('>')
        {
            let key = header[start + 1..start + 1 + len].trim().to_string();
            let mut values = Vec::new();
            while let Some(value) = lines.next_if(|l| !l.trim().is_empty()) {
                values.push(value.trim());
            }
            properties.push((key, values.join(" ")));
        } else if properties.is_empty() {
            table.push(line);
        }
    }
    (table, properties)
}

fn is_element_symbol(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_lowercase())
        && token.len() <= 3
}

/// Atom and bond counts are three-column fields in a V2000 counts line.
const V2000_MAX_COUNT: usize = 999;

/// Fixed-width integer field, falling back to whitespace tokens.
fn field(line: &str, range: std::ops::Range<usize>, token: usize) -> Option<usize> {
    line.get(range)
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| line.split_whitespace().nth(token)?.parse().ok())
}

/// MDL V2000 connection table parser.
///
/// Requires a valid counts line, exactly the declared number of atom and
/// bond lines, and the `M  END` terminator.
#[derive(Debug, Default)]
pub struct StrictMolParser;

impl MoleculeParser for StrictMolParser {
    fn name(&self) -> &'static str {
        "strict_v2000"
    }

    fn parse(&self, record: &str) -> Result<Molecule, String> {
        let (table, properties) = split_properties(record);
        if table.len() < 4 {
            return Err("header block is incomplete".into());
        }
        let counts = table[3];
        let atom_count = field(counts, 0..3, 0).ok_or("invalid atom count")?;
        let bond_count = field(counts, 3..6, 1).ok_or("invalid bond count")?;
        if atom_count == 0 {
            return Err("record declares no atoms".into());
        }
        if atom_count > V2000_MAX_COUNT || bond_count > V2000_MAX_COUNT {
            return Err(format!(
                "counts line declares {atom_count} atoms and {bond_count} bonds, \
                 the V2000 limit is {V2000_MAX_COUNT}"
            ));
        }

        let atom_lines = table.get(4..4 + atom_count).ok_or("atom block is truncated")?;
        let mut atoms = Vec::with_capacity(atom_count);
        for (i, line) in atom_lines.iter().enumerate() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let coords_ok =
                tokens.len() >= 4 && tokens[..3].iter().all(|t| t.parse::<f64>().is_ok());
            if !coords_ok || !is_element_symbol(tokens[3]) {
                return Err(format!("atom line {} is malformed", i + 1));
            }
            atoms.push(tokens[3].to_string());
        }

        let bond_start = 4 + atom_count;
        let bond_lines = table
            .get(bond_start..bond_start + bond_count)
            .ok_or("bond block is truncated")?;
        let mut bonds = Vec::with_capacity(bond_count);
        for (i, line) in bond_lines.iter().enumerate() {
            let from = field(line, 0..3, 0);
            let to = field(line, 3..6, 1);
            let order = field(line, 6..9, 2);
            match (from, to, order) {
                (Some(a), Some(b), Some(o))
                    if (1..=atom_count).contains(&a) && (1..=atom_count).contains(&b) =>
                {
                    bonds.push((a, b, o.min(u8::MAX as usize) as u8));
                }
                _ => return Err(format!("bond line {} is malformed", i + 1)),
            }
        }

        if !table[bond_start + bond_count..]
            .iter()
            .any(|l| l.trim_start().starts_with("M  END"))
        {
            return Err("missing M  END terminator".into());
        }

        let name = table[0].trim();
        Ok(Molecule {
            name: (!name.is_empty()).then(|| name.to_string()),
            atoms,
            bonds,
            properties,
        })
    }
}

/// Line-oriented parser that tolerates wrong counts and missing terminators.
///
/// Atom lines are recognised by three coordinates followed by an element
/// symbol; bond lines by three small integers after the atom block.
#[derive(Debug, Default)]
pub struct LenientMolParser;

impl MoleculeParser for LenientMolParser {
    fn name(&self) -> &'static str {
        "lenient_lines"
    }

    fn parse(&self, record: &str) -> Result<Molecule, String> {
        let (table, properties) = split_properties(record);
        let mut atoms = Vec::new();
        let mut bonds = Vec::new();

        for line in table.iter().skip(1) {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() == Some(&"M") {
                continue;
            }
            let is_atom = tokens.len() >= 4
                && tokens[..3].iter().all(|t| t.contains('.') && t.parse::<f64>().is_ok())
                && is_element_symbol(tokens[3]);
            if is_atom {
                atoms.push(tokens[3].to_string());
                continue;
            }
            if atoms.is_empty() || tokens.len() < 3 {
                continue;
            }
            let ints: Option<Vec<usize>> = tokens[..3].iter().map(|t| t.parse().ok()).collect();
            if let Some(ints) = ints
                && ints[0] >= 1
                && ints[1] >= 1
                && ints[0] <= atoms.len()
                && ints[1] <= atoms.len()
            {
                bonds.push((ints[0], ints[1], ints[2].min(u8::MAX as usize) as u8));
            }
        }

        if atoms.is_empty() {
            return Err("no atom lines found".into());
        }
        let name = table.first().map(|l| l.trim()).unwrap_or_default();
        Ok(Molecule {
            name: (!name.is_empty()).then(|| name.to_string()),
            atoms,
            bonds,
            properties,
        })
    }
}

/// Extracts one unit per structure record.
pub struct ChemistryExtractor {
    parser: Arc<dyn MoleculeParser>,
}

impl ChemistryExtractor {
    /// Extractor using the strict V2000 parser.
    pub fn new() -> Self {
        Self::with_parser(Arc::new(StrictMolParser))
    }

    /// Extractor using the line-oriented parser.
    pub fn lenient() -> Self {
        Self::with_parser(Arc::new(LenientMolParser))
    }

    pub fn with_parser(parser: Arc<dyn MoleculeParser>) -> Self {
        Self { parser }
    }
}

impl Default for ChemistryExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChemistryExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChemistryExtractor")
            .field("parser", &self.parser.name())
            .finish()
    }
}

/// Records between `$$$$` lines, dropping whitespace-only trailers.
fn split_records(text: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim() == RECORD_DELIMITER {
            records.push(&text[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    records.push(&text[start..]);
    records.retain(|r| !r.trim().is_empty());
    records
}

#[async_trait]
impl Extractor for ChemistryExtractor {
    fn name(&self) -> &'static str {
        "chemistry"
    }

    fn can_handle(&self, extension: &str) -> bool {
        matches!(extension, "sdf" | "mol")
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
        let records = split_records(&text);
        let total = records.len();

        let mut parsed = Vec::new();
        let mut malformed = 0;
        for (index, record) in records.iter().enumerate() {
            match self.parser.parse(record) {
                Ok(molecule) => parsed.push((index, molecule)),
                Err(reason) => {
                    malformed += 1;
                    warn!(
                        stage = "structure_record_skipped",
                        filename = %request.filename,
                        parser = self.parser.name(),
                        record = index + 1,
                        reason = %reason,
                        "Skipping malformed structure record"
                    );
                }
            }
        }

        if parsed.is_empty() {
            return Err(ExtractionError::NoValidRecords { total, malformed });
        }
        debug!(
            stage = "structures_parsed",
            filename = %request.filename,
            valid = parsed.len(),
            malformed,
            "Parsed structure records"
        );

        let valid = parsed.len();
        Ok(parsed
            .into_iter()
            .map(|(index, molecule)| {
                let fallback = format!("Record {}", index + 1);
                let unit = ExtractedUnit::new(molecule.summary(&fallback))
                    .with_meta("extractor", self.name())
                    .with_meta("parser", self.parser.name())
                    .with_meta("record_index", index)
                    .with_meta("formula", molecule.formula())
                    .with_meta("atom_count", molecule.atoms.len())
                    .with_meta("valid_records", valid)
                    .with_meta("malformed_records", malformed)
                    .with_meta("encoding", encoding);
                match molecule.molecular_weight() {
                    Some(w) => unit.with_meta("molecular_weight", (w * 100.0).round() / 100.0),
                    None => unit,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const METHANOL: &str = "\
Methanol
  test

  2  1  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    1.4000    0.0000    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0  0  0  0
M  END
> <PUBCHEM_ID>
887

> <SOURCE>
unit test

";

    const WATER: &str = "\
Water
  test

  3  2  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
    0.9600    0.0000    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
   -0.2400    0.9300    0.0000 H   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0  0  0  0
  1  3  1  0  0  0  0
M  END
";

    const BROKEN: &str = "Broken\n\n\n  x  y\nnot an atom\n";

    fn sdf(records: &[&str]) -> String {
        records
            .iter()
            .map(|r| format!("{r}$$$$\n"))
            .collect::<String>()
    }

    #[test]
    fn test_formula_and_weight() {
        let molecule = StrictMolParser.parse(WATER).unwrap();
        assert_eq!(molecule.formula(), "H2O");
        let weight = molecule.molecular_weight().unwrap();
        assert!((weight - 18.015).abs() < 0.01);
    }

    #[test]
    fn test_hill_order_puts_carbon_first() {
        let molecule = Molecule {
            atoms: ["O", "H", "C", "N", "H"].map(String::from).to_vec(),
            ..Default::default()
        };
        assert_eq!(molecule.formula(), "CH2NO");
    }

    #[test]
    fn test_properties_parsed() {
        let molecule = StrictMolParser.parse(METHANOL).unwrap();
        assert_eq!(molecule.name.as_deref(), Some("Methanol"));
        assert_eq!(
            molecule.properties,
            vec![
                ("PUBCHEM_ID".to_string(), "887".to_string()),
                ("SOURCE".to_string(), "unit test".to_string()),
            ]
        );
    }

    #[test]
    fn test_strict_requires_terminator() {
        let without_end = WATER.replace("M  END\n", "");
        assert!(StrictMolParser.parse(&without_end).is_err());
        assert!(LenientMolParser.parse(&without_end).is_ok());
    }

    #[rstest]
    #[case::wide_atom_count("Name\n  x\n\n\t\t\t18446744073709551615  0  0\nM  END\n")]
    #[case::over_v2000_limit("Name\n  x\n\n\t\t\t1000 0\nM  END\n")]
    #[case::wide_bond_count("Name\n  x\n\n  1\t\t\t18446744073709551615\n    0.0 0.0 0.0 O\nM  END\n")]
    fn test_strict_rejects_oversized_counts(#[case] record: &str) {
        assert!(StrictMolParser.parse(record).is_err());
    }

    #[tokio::test]
    async fn test_oversized_counts_record_counts_as_malformed() {
        let oversized = "Huge\n  x\n\n\t\t\t18446744073709551615  0  0\nM  END\n";
        let text = sdf(&[WATER, oversized]);
        let request = ExtractionRequest::new(text.into_bytes(), "set.sdf");
        let units = ChemistryExtractor::new().extract(&request).await.unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].metadata["malformed_records"], 1);
    }

    #[test]
    fn test_parsers_agree_on_valid_record() {
        let strict = StrictMolParser.parse(METHANOL).unwrap();
        let lenient = LenientMolParser.parse(METHANOL).unwrap();
        assert_eq!(strict.atoms, lenient.atoms);
        assert_eq!(strict.bonds, lenient.bonds);
        assert_eq!(strict.fingerprint(), lenient.fingerprint());
    }

    #[rstest]
    #[case::strict(ChemistryExtractor::new())]
    #[case::lenient(ChemistryExtractor::lenient())]
    #[tokio::test]
    async fn test_malformed_record_is_skipped(#[case] extractor: ChemistryExtractor) {
        let text = sdf(&[METHANOL, BROKEN, WATER]);
        let request = ExtractionRequest::new(text.into_bytes(), "set.sdf");
        let units = extractor.extract(&request).await.unwrap();

        assert_eq!(units.len(), 2);
        assert!(units[0].text.starts_with("Molecule: Methanol\nFormula: CO"));
        assert!(units[0].text.contains("  PUBCHEM_ID: 887"));
        assert!(units[1].text.contains("Formula: H2O"));
        assert_eq!(units[1].metadata["record_index"], 2);
        assert_eq!(units[1].metadata["malformed_records"], 1);
    }

    #[tokio::test]
    async fn test_no_valid_records_fails() {
        let text = sdf(&[BROKEN, BROKEN]);
        let request = ExtractionRequest::new(text.into_bytes(), "bad.sdf");
        let err = ChemistryExtractor::new().extract(&request).await.unwrap_err();
        match err {
            ExtractionError::NoValidRecords { total, malformed } => {
                assert_eq!(total, 2);
                assert_eq!(malformed, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_mol_without_delimiter() {
        let request = ExtractionRequest::new(WATER.as_bytes().to_vec(), "water.mol");
        let units = ChemistryExtractor::new().extract(&request).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].text.contains("Connectivity fingerprint: "));
    }
}
