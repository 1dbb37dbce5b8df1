use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::reconcile::csv_ingest::{validate_reader, CsvOptions, CsvValidation};
use crate::reconcile::{IdentityIndex, IndexBuilder};
use crate::schema::RecordTable;

#[derive(Debug, Clone)]
pub struct CsvAuditConfig {
    pub path: PathBuf,
    pub delimiter: u8,
    /// Also resolve the valid rows' userIds against `profiles`.
    pub check_profiles: bool,
    pub json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvAuditReport<'a> {
    file: String,
    validation: &'a CsvValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<&'a IdentityIndex>,
}

pub fn render(validation: &CsvValidation) -> String {
    let mut out = String::new();
    let total = validation.valid.len() + validation.invalid.len();
    writeln!(out, "CSV AUDIT:").ok();
    writeln!(out, "rows: {total}").ok();
    writeln!(out, "valid: {}", validation.valid.len()).ok();
    writeln!(out, "invalid: {}", validation.invalid.len()).ok();
    for row in &validation.invalid {
        let mut bad = Vec::new();
        if !row.scan_id_valid {
            bad.push(format!("scanId={:?}", row.scan_id));
        }
        if !row.user_id_valid {
            bad.push(format!("userId={:?}", row.user_id));
        }
        writeln!(out, "  line {}: {}", row.line_number, bad.join(", ")).ok();
    }
    if !validation.duplicate_scan_ids.is_empty() {
        writeln!(out, "duplicate scanIds: {}", validation.duplicate_scan_ids.len()).ok();
        for (scan, lines) in &validation.duplicate_scan_ids {
            writeln!(out, "  {scan}: lines {lines:?}").ok();
        }
    }
    out
}

pub async fn run(cfg: CsvAuditConfig) -> Result<()> {
    let file = File::open(&cfg.path).with_context(|| format!("opening {}", cfg.path.display()))?;
    let opts = CsvOptions {
        delimiter: cfg.delimiter,
        ..CsvOptions::default()
    };
    let validation = validate_reader(BufReader::new(file), &opts)
        .with_context(|| format!("validating {}", cfg.path.display()))?;
    info!(
        file = %cfg.path.display(),
        valid = validation.valid.len(),
        invalid = validation.invalid.len(),
        "csv validated"
    );

    let identity = if cfg.check_profiles {
        let (recon_cfg, store) = super::open_store().await?;
        let index = IndexBuilder::new(store.as_ref(), recon_cfg.page_size)
            .build_from_pairs(RecordTable::Analyses, &validation.pairs())
            .await?;
        Some(index)
    } else {
        None
    };

    if cfg.json {
        return super::print_json(&CsvAuditReport {
            file: cfg.path.display().to_string(),
            validation: &validation,
            identity: identity.as_ref(),
        });
    }
    print!("{}", render(&validation));
    if let Some(index) = &identity {
        println!();
        print!("{}", super::audit::render(index, 20));
    }
    Ok(())
}
