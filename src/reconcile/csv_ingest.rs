//! Validation of `scanId;userId;...` exports before they are trusted as audit input.
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

use csv::{ByteRecord, ReaderBuilder, Trim};
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::CsvError;

#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub scan_id_column: String,
    pub user_id_column: String,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b';',
            scan_id_column: "scanId".into(),
            user_id_column: "userId".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidRow {
    pub scan_id: Uuid,
    pub user_id: Uuid,
    pub line_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRow {
    pub scan_id: String,
    pub user_id: String,
    pub line_number: u64,
    pub scan_id_valid: bool,
    pub user_id_valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvValidation {
    pub valid: Vec<ValidRow>,
    pub invalid: Vec<InvalidRow>,
    /// scanIds that occur on more than one valid row, with every line they appear on.
    pub duplicate_scan_ids: BTreeMap<Uuid, Vec<u64>>,
}

impl CsvValidation {
    /// `(scanId, userId)` pairs of the valid rows, in file order.
    pub fn pairs(&self) -> Vec<(Uuid, Uuid)> {
        self.valid.iter().map(|r| (r.scan_id, r.user_id)).collect()
    }
}

fn uuid_grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static uuid regex")
    })
}

/// Canonical 8-4-4-4-12 hex form only; braces, urn prefixes and bare hex are rejected.
pub fn is_canonical_uuid(s: &str) -> bool {
    uuid_grammar().is_match(s)
}

fn clean(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

fn header_key(raw: &str) -> String {
    clean(raw).to_ascii_lowercase().replace(['_', '-', ' '], "")
}

pub fn validate_csv(content: &str, opts: &CsvOptions) -> Result<CsvValidation, CsvError> {
    validate_reader(content.as_bytes(), opts)
}

pub fn validate_reader<R: Read>(input: R, opts: &CsvOptions) -> Result<CsvValidation, CsvError> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(opts.delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input);

    let headers = rdr.byte_headers()?.clone();
    if headers.is_empty() || headers.iter().all(|h| clean(&String::from_utf8_lossy(h)).is_empty()) {
        return Err(CsvError::Empty);
    }
    let position = |name: &str| {
        let want = header_key(name);
        headers
            .iter()
            .position(|h| header_key(&String::from_utf8_lossy(h)) == want)
            .ok_or_else(|| CsvError::MissingColumn(name.to_string()))
    };
    let idx_scan = position(&opts.scan_id_column)?;
    let idx_user = position(&opts.user_id_column)?;

    let mut out = CsvValidation::default();
    let mut seen: BTreeMap<Uuid, Vec<u64>> = BTreeMap::new();
    let mut rec = ByteRecord::new();
    while rdr.read_byte_record(&mut rec)? {
        let line_number = rec.position().map(|p| p.line()).unwrap_or(0);
        let field = |i: usize| clean(&String::from_utf8_lossy(rec.get(i).unwrap_or_default()));
        // Only a line with no delimiter and nothing but whitespace is blank; `;`
        // or `"";""` are rows with empty fields and get reported as invalid.
        if rec.len() <= 1 && rec.iter().all(|f| f.iter().all(u8::is_ascii_whitespace)) {
            debug!(line_number, "skipping blank csv line");
            continue;
        }
        let scan_id = field(idx_scan);
        let user_id = field(idx_user);
        let parse = |s: &str| {
            is_canonical_uuid(s)
                .then(|| Uuid::parse_str(s).ok())
                .flatten()
        };
        match (parse(&scan_id), parse(&user_id)) {
            (Some(scan), Some(user)) => {
                seen.entry(scan).or_default().push(line_number);
                out.valid.push(ValidRow {
                    scan_id: scan,
                    user_id: user,
                    line_number,
                });
            }
            (scan, user) => out.invalid.push(InvalidRow {
                scan_id,
                user_id,
                line_number,
                scan_id_valid: scan.is_some(),
                user_id_valid: user.is_some(),
            }),
        }
    }
    out.duplicate_scan_ids = seen.into_iter().filter(|(_, lines)| lines.len() > 1).collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "11111111-1111-1111-1111-111111111111";
    const B: &str = "22222222-2222-2222-2222-222222222222";

    #[test]
    fn well_formed_row_is_valid() {
        let content = format!("scanId;userId;productName\n{A};{B};X\n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(report.invalid, vec![]);
        assert_eq!(
            report.valid,
            vec![ValidRow {
                scan_id: Uuid::parse_str(A).unwrap(),
                user_id: Uuid::parse_str(B).unwrap(),
                line_number: 2,
            }]
        );
    }

    #[test]
    fn malformed_scan_id_is_reported_not_thrown() {
        let content = format!("scanId;userId;productName\nnot-a-uuid;{B};X\n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert!(report.valid.is_empty());
        assert_eq!(report.invalid.len(), 1);
        let row = &report.invalid[0];
        assert!(!row.scan_id_valid);
        assert!(row.user_id_valid);
        assert_eq!(row.scan_id, "not-a-uuid");
        assert_eq!(row.line_number, 2);
    }

    #[test]
    fn header_order_is_not_fixed_and_fields_are_cleaned() {
        let content = format!(
            "productName;user_id;scan_id\nSerum; \"{B}\" ;\"{}\"\n",
            A.to_uppercase()
        );
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(report.valid.len(), 1, "{report:?}");
        assert_eq!(report.valid[0].scan_id, Uuid::parse_str(A).unwrap());
    }

    #[test]
    fn trailing_blank_lines_are_not_rows() {
        let content = format!("scanId;userId\n{A};{B}\n\n   \n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(report.valid.len(), 1);
        assert!(report.invalid.is_empty());
    }

    #[test]
    fn rows_of_empty_fields_are_invalid_not_blank() {
        let content = format!("scanId;userId\n{A};{B}\n;\n\"\";\"\"\n\n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(report.valid.len(), 1);
        let lines: Vec<u64> = report.invalid.iter().map(|r| r.line_number).collect();
        assert_eq!(lines, vec![3, 4]);
        for row in &report.invalid {
            assert!(!row.scan_id_valid && !row.user_id_valid);
            assert_eq!((row.scan_id.as_str(), row.user_id.as_str()), ("", ""));
        }
    }

    #[test]
    fn short_rows_are_invalid_with_line_numbers() {
        let content = format!("scanId;userId\n{A};{B}\n{A}\n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].line_number, 3);
        assert!(report.invalid[0].scan_id_valid);
        assert!(!report.invalid[0].user_id_valid);
    }

    #[test]
    fn duplicate_scan_ids_are_collected() {
        let content = format!("scanId;userId\n{A};{B}\n{B};{A}\n{A};{A}\n");
        let report = validate_csv(&content, &CsvOptions::default()).unwrap();
        assert_eq!(
            report.duplicate_scan_ids.get(&Uuid::parse_str(A).unwrap()),
            Some(&vec![2, 4])
        );
        assert_eq!(report.duplicate_scan_ids.len(), 1);
    }

    #[test]
    fn missing_columns_are_setup_errors() {
        let err = validate_csv("id;owner\nx;y\n", &CsvOptions::default()).unwrap_err();
        assert!(matches!(err, CsvError::MissingColumn(c) if c == "scanId"));
        assert!(matches!(validate_csv("", &CsvOptions::default()), Err(CsvError::Empty)));
    }

    #[test]
    fn uuid_grammar_is_strict() {
        assert!(is_canonical_uuid(A));
        assert!(is_canonical_uuid("ABCDEF01-2345-6789-abcd-ef0123456789"));
        assert!(!is_canonical_uuid("11111111111111111111111111111111"));
        assert!(!is_canonical_uuid("{11111111-1111-1111-1111-111111111111}"));
        assert!(!is_canonical_uuid("11111111-1111-1111-1111-11111111111g"));
    }

    #[test]
    fn custom_delimiter() {
        let opts = CsvOptions {
            delimiter: b',',
            ..CsvOptions::default()
        };
        let content = format!("scanId,userId\n{A},{B}\n");
        assert_eq!(validate_csv(&content, &opts).unwrap().pairs().len(), 1);
    }
}
