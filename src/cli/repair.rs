use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::config::CredentialTier;
use crate::reconcile::{
    PlannedAction, ReconcileOutcome, Reconciler, ReconciliationAction, RemapTable, RepairReport,
};
use crate::schema::RecordTable;

#[derive(Debug, Clone, Default)]
pub struct RepairConfig {
    pub table: Option<RecordTable>,
    /// `OLD=NEW` user id pairs.
    pub remaps: Vec<String>,
    /// JSON object of `old -> new` user ids, merged under `remaps`.
    pub remap_file: Option<PathBuf>,
    /// Plan only when false.
    pub execute: bool,
    pub json: bool,
}

/// Totals across every table of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub flagged: usize,
    pub partial_promotions: usize,
}

impl RepairSummary {
    fn add(&mut self, report: &RepairReport) {
        self.succeeded += report.succeeded.len();
        self.failed += report.failed.len();
        self.flagged += report.flagged.len();
        self.partial_promotions += report.partial_promotions.len();
    }
}

pub fn load_remap(cfg: &RepairConfig) -> Result<RemapTable> {
    let mut remap = match &cfg.remap_file {
        Some(path) => RemapTable::from_file(path)?,
        None => RemapTable::new(),
    };
    remap.merge(RemapTable::from_pairs(&cfg.remaps)?);
    Ok(remap)
}

fn describe(item: &PlannedAction) -> String {
    let from = item
        .user_id
        .map(|u| u.to_string())
        .unwrap_or_else(|| "<null>".into());
    let what = match item.action {
        ReconciliationAction::Reassign { new_user_id } => format!("reassign {from} -> {new_user_id}"),
        ReconciliationAction::PromoteFromStaging { staging_table } => {
            format!("promote from {staging_table} (was {from})")
        }
        ReconciliationAction::FlagForDeletion => format!("flag for deletion (owner {from})"),
    };
    format!("{what}: {} records", item.record_ids.len())
}

pub fn render(outcome: &ReconcileOutcome) -> String {
    let mut out = String::new();
    writeln!(out, "RECONCILIATION: {}", outcome.index.table).ok();
    writeln!(
        out,
        "matched: {}  orphaned: {}",
        outcome.index.matched,
        outcome.index.orphaned_record_count()
    )
    .ok();
    writeln!(out, "plan ({} actions):", outcome.plan.len()).ok();
    for item in &outcome.plan {
        writeln!(out, "  {}", describe(item)).ok();
        if let Some(note) = &item.note {
            writeln!(out, "    note: {note}").ok();
        }
        for hint in &item.advisory {
            writeln!(
                out,
                "    advisory: {} looks like {:?} of {} ({:.2}), not applied",
                hint.record_id,
                hint.matched_label,
                hint.email.as_deref().unwrap_or("unknown email"),
                hint.score
            )
            .ok();
        }
    }
    if let Some(report) = &outcome.report {
        writeln!(out, "succeeded: {}", report.succeeded.len()).ok();
        writeln!(out, "failed: {}", report.failed.len()).ok();
        for f in &report.failed {
            writeln!(out, "  {}: {}", f.record_id, f.reason).ok();
        }
        writeln!(out, "flagged: {}", report.flagged.len()).ok();
        if report.has_partial_promotions() {
            writeln!(out, "PARTIAL PROMOTIONS: {}", report.partial_promotions.len()).ok();
            for p in &report.partial_promotions {
                writeln!(out, "  {p}").ok();
            }
        }
    }
    out
}

pub async fn run(cfg: RepairConfig) -> Result<RepairSummary> {
    let remap = load_remap(&cfg)?;
    let (recon_cfg, store) = super::open_store().await?;
    if cfg.execute && recon_cfg.tier == CredentialTier::ReadOnly {
        warn!("executing with a read-only credential; writes will likely be denied");
    }
    let recon = Reconciler::new(store, &recon_cfg);
    let tables = match cfg.table {
        Some(t) => vec![t],
        None => RecordTable::ALL.to_vec(),
    };

    let mut summary = RepairSummary::default();
    let mut outcomes = Vec::with_capacity(tables.len());
    for table in tables {
        let outcome = recon.run(table, &remap, cfg.execute).await?;
        if let Some(report) = &outcome.report {
            summary.add(report);
        }
        if !cfg.json {
            println!("{}", render(&outcome));
        }
        outcomes.push(outcome);
    }
    if cfg.json {
        super::print_json(&outcomes)?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::index::assemble;
    use crate::schema::Table;
    use std::collections::BTreeMap;
    use std::io::Write;
    use uuid::Uuid;

    #[test]
    fn remap_args_override_remap_file() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let path = std::env::temp_dir().join(format!("recon-remap-{}.json", Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{{\"{a}\": \"{b}\"}}").unwrap();
        drop(f);

        let cfg = RepairConfig {
            remaps: vec![format!("{a}={c}")],
            remap_file: Some(path.clone()),
            ..RepairConfig::default()
        };
        let remap = load_remap(&cfg).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(remap.get(&a), Some(c));
        assert_eq!(remap.len(), 1);
    }

    #[test]
    fn plan_text_shows_actions_and_notes() {
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        let outcome = ReconcileOutcome {
            index: assemble(RecordTable::Analyses, Vec::new(), BTreeMap::new()),
            plan: vec![
                PlannedAction {
                    table: RecordTable::Analyses,
                    user_id: Some(old),
                    record_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
                    action: ReconciliationAction::Reassign { new_user_id: new },
                    note: None,
                    advisory: Vec::new(),
                },
                PlannedAction {
                    table: RecordTable::Analyses,
                    user_id: None,
                    record_ids: vec![Uuid::new_v4()],
                    action: ReconciliationAction::PromoteFromStaging {
                        staging_table: Table::UserAnalysesStaging,
                    },
                    note: Some("checked".into()),
                    advisory: Vec::new(),
                },
            ],
            report: None,
        };
        let text = render(&outcome);
        assert!(text.contains(&format!("reassign {old} -> {new}: 2 records")));
        assert!(text.contains("promote from user_analyses_staging (was <null>): 1 records"));
        assert!(text.contains("note: checked"));
        assert!(!text.contains("succeeded"));
    }
}
