use std::fmt::Write as _;

use anyhow::Result;

use crate::reconcile::{IdentityIndex, Reconciler};
use crate::schema::RecordTable;

#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    /// Limit the audit to one table; all record tables otherwise.
    pub table: Option<RecordTable>,
    pub json: bool,
    /// Orphan groups listed per table in the text report.
    pub show: usize,
}

pub fn render(index: &IdentityIndex, show: usize) -> String {
    let mut out = String::new();
    writeln!(out, "IDENTITY AUDIT: {}", index.table).ok();
    writeln!(out, "profiles: {}", index.total_profiles).ok();
    writeln!(out, "records: {}", index.total_records).ok();
    writeln!(out, "matched: {}", index.matched).ok();
    writeln!(
        out,
        "orphaned: {} records under {} user ids",
        index.orphaned_record_count(),
        index.orphaned.len()
    )
    .ok();
    let mut groups: Vec<_> = index.orphaned.iter().collect();
    groups.sort_by(|a, b| b.record_count.cmp(&a.record_count));
    for entry in groups.iter().take(show) {
        let user = entry
            .user_id
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<null or malformed>".into());
        writeln!(out, "  {user}: {} records", entry.record_count).ok();
    }
    if groups.len() > show {
        writeln!(out, "  ... {} more", groups.len() - show).ok();
    }
    out
}

pub async fn run(cfg: AuditConfig) -> Result<()> {
    let (recon_cfg, store) = super::open_store().await?;
    let recon = Reconciler::new(store, &recon_cfg);
    let tables = match cfg.table {
        Some(t) => vec![t],
        None => RecordTable::ALL.to_vec(),
    };
    let mut indexes = Vec::with_capacity(tables.len());
    for table in tables {
        indexes.push(recon.audit(table).await?);
    }
    if cfg.json {
        return super::print_json(&indexes);
    }
    for index in &indexes {
        println!("{}", render(index, cfg.show));
    }
    Ok(())
}
