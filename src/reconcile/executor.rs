//! Applies a reconciliation plan, one record at a time, best effort.
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::advisory::AdvisoryHint;
use super::planner::{PlannedAction, ReconciliationAction};
use crate::error::{PartialPromotionError, ReconcileError, StoreError};
use crate::schema::{Row, Table};
use crate::store::{Filter, Query, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub record_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedRecord {
    pub record_id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisory: Vec<AdvisoryHint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<FailedRecord>,
    pub flagged: Vec<FlaggedRecord>,
    pub partial_promotions: Vec<PartialPromotionError>,
}

impl RepairReport {
    pub fn has_partial_promotions(&self) -> bool {
        !self.partial_promotions.is_empty()
    }

    fn fail(&mut self, record_id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%record_id, %reason, "repair failed");
        self.failed.push(FailedRecord { record_id, reason });
    }
}

enum Step {
    Done,
    Failed(String),
    Partial(PartialPromotionError),
}

pub struct Executor<'a> {
    store: &'a dyn Store,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Execute every planned action. Per-record failures are collected in the report;
    /// only an authorization denial stops the run.
    #[instrument(skip_all, fields(actions = plan.len()))]
    pub async fn execute(&self, plan: &[PlannedAction]) -> Result<RepairReport, ReconcileError> {
        let mut report = RepairReport::default();
        for item in plan {
            match item.action {
                ReconciliationAction::Reassign { new_user_id } => {
                    self.reassign(item, new_user_id, &mut report).await?
                }
                ReconciliationAction::PromoteFromStaging { staging_table } => {
                    self.promote(item, staging_table, &mut report).await?
                }
                ReconciliationAction::FlagForDeletion => {
                    report.flagged.extend(item.record_ids.iter().map(|&record_id| {
                        FlaggedRecord {
                            record_id,
                            user_id: item.user_id,
                            note: item.note.clone(),
                            advisory: item
                                .advisory
                                .iter()
                                .filter(|h| h.record_id == record_id)
                                .cloned()
                                .collect(),
                        }
                    }))
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            flagged = report.flagged.len(),
            partial = report.partial_promotions.len(),
            "repair finished"
        );
        Ok(report)
    }

    async fn profile_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let n = self
            .store
            .count(Table::Profiles, &[Filter::eq("id", id.to_string())])
            .await?;
        Ok(n > 0)
    }

    async fn reassign(
        &self,
        item: &PlannedAction,
        new_user_id: Uuid,
        report: &mut RepairReport,
    ) -> Result<(), ReconcileError> {
        // The plan may be stale: the target must exist right now.
        match self.profile_exists(new_user_id).await {
            Ok(true) => {}
            Ok(false) => {
                for &id in &item.record_ids {
                    report.fail(id, format!("target profile {new_user_id} no longer exists"));
                }
                return Ok(());
            }
            Err(e) => {
                let e = escalate(e, "reassign target check")?;
                for &id in &item.record_ids {
                    report.fail(id, format!("could not verify target profile: {e}"));
                }
                return Ok(());
            }
        }

        let old = match item.user_id {
            Some(u) => Value::String(u.to_string()),
            None => Value::Null,
        };
        let table = item.table.table();
        for &id in &item.record_ids {
            let filters = [
                Filter::eq("id", id.to_string()),
                Filter::Eq("user_id".into(), old.clone()),
            ];
            let mut patch = Row::new();
            patch.insert("user_id".into(), Value::String(new_user_id.to_string()));
            match self.store.update(table, &filters, patch).await {
                Ok(0) => report.fail(id, "record changed since planning; nothing updated"),
                Ok(_) => {
                    info!(%table, record_id = %id, to = %new_user_id, "reassigned");
                    report.succeeded.push(id);
                }
                Err(e) => {
                    let e = escalate(e, "reassign update")?;
                    report.fail(id, e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn promote(
        &self,
        item: &PlannedAction,
        staging: Table,
        report: &mut RepairReport,
    ) -> Result<(), ReconcileError> {
        let primary = item.table.table();
        for &id in &item.record_ids {
            match self.promote_one(primary, staging, id).await? {
                Step::Done => {
                    info!(%primary, %staging, record_id = %id, "promoted from staging");
                    report.succeeded.push(id);
                }
                Step::Failed(reason) => report.fail(id, reason),
                Step::Partial(p) => {
                    error!(
                        record_id = %id,
                        %staging,
                        %primary,
                        reason = %p.reason,
                        "PARTIAL PROMOTION: row copied but staging row not removed; resolve manually"
                    );
                    report.partial_promotions.push(p);
                }
            }
        }
        Ok(())
    }

    async fn promote_one(&self, primary: Table, staging: Table, id: Uuid) -> Result<Step, ReconcileError> {
        let by_id = [Filter::eq("id", id.to_string())];
        let row = match self.store.get(staging, &Query::new().filter(by_id[0].clone())).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(r) => r,
                None => return Ok(Step::Failed(format!("staging row vanished from {staging}"))),
            },
            Err(e) => return Ok(Step::Failed(escalate(e, "staging read")?.to_string())),
        };

        let staged_user = row
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let Some(staged_user) = staged_user else {
            return Ok(Step::Failed("staging row has no valid user_id".into()));
        };
        match self.profile_exists(staged_user).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(Step::Failed(format!(
                    "staged owner {staged_user} no longer exists"
                )))
            }
            Err(e) => return Ok(Step::Failed(escalate(e, "staged owner check")?.to_string())),
        }

        if let Err(e) = self.store.upsert(primary, row).await {
            return Ok(Step::Failed(escalate(e, "promotion copy")?.to_string()));
        }

        match self.store.delete(staging, &by_id).await {
            Ok(_) => Ok(Step::Done),
            Err(e) => {
                let e = escalate(e, "staging delete")?;
                Ok(Step::Partial(PartialPromotionError {
                    record_id: id,
                    staging_table: staging,
                    primary_table: primary,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

/// Authorization denials end the run; everything else stays a per-record outcome.
fn escalate(e: StoreError, operation: &str) -> Result<StoreError, ReconcileError> {
    if e.is_authorization() {
        Err(ReconcileError::Authorization {
            operation: operation.to_string(),
            source: e,
        })
    } else {
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordTable;
    use crate::store::memory::{MemoryStore, Op};
    use serde_json::json;

    fn uid(n: u32) -> Uuid {
        Uuid::parse_str(&format!("{n:08x}-0000-4000-8000-000000000000")).unwrap()
    }

    fn store() -> MemoryStore {
        let s = MemoryStore::new();
        s.seed(Table::Profiles, [json!({"id": uid(1).to_string(), "email": "p1@example.com"})]);
        s.seed(
            Table::UserAnalyses,
            [
                json!({"id": uid(10).to_string(), "user_id": uid(2).to_string(), "product_name": "old"}),
                json!({"id": uid(11).to_string(), "user_id": uid(2).to_string()}),
            ],
        );
        s
    }

    fn action(record_ids: Vec<Uuid>, action: ReconciliationAction) -> PlannedAction {
        PlannedAction {
            table: RecordTable::Analyses,
            user_id: Some(uid(2)),
            record_ids,
            action,
            note: None,
            advisory: Vec::new(),
        }
    }

    fn user_of(s: &MemoryStore, table: Table, id: Uuid) -> Option<String> {
        s.row_by_id(table, id)
            .and_then(|r| r.get("user_id").and_then(Value::as_str).map(str::to_string))
    }

    #[tokio::test]
    async fn reassign_touches_only_captured_records() {
        let s = store();
        let plan = [action(vec![uid(10)], ReconciliationAction::Reassign { new_user_id: uid(1) })];
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert_eq!(report.succeeded, vec![uid(10)]);
        assert_eq!(user_of(&s, Table::UserAnalyses, uid(10)), Some(uid(1).to_string()));
        // Same old user id, but not captured at planning time.
        assert_eq!(user_of(&s, Table::UserAnalyses, uid(11)), Some(uid(2).to_string()));
    }

    #[tokio::test]
    async fn reassign_to_deleted_profile_fails_without_writing() {
        let s = store();
        let plan = [action(vec![uid(10)], ReconciliationAction::Reassign { new_user_id: uid(1) })];
        s.delete(Table::Profiles, &[Filter::eq("id", uid(1).to_string())]).await.unwrap();
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("no longer exists"));
        assert_eq!(user_of(&s, Table::UserAnalyses, uid(10)), Some(uid(2).to_string()));
        assert_eq!(s.calls(Op::Update, Table::UserAnalyses), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let s = store();
        s.fail_next(Op::Update, Table::UserAnalyses, StoreError::Constraint("fk".into()));
        let plan = [action(
            vec![uid(10), uid(11)],
            ReconciliationAction::Reassign { new_user_id: uid(1) },
        )];
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].record_id, uid(10));
        assert_eq!(report.succeeded, vec![uid(11)]);
    }

    #[tokio::test]
    async fn record_changed_since_planning_is_a_failure() {
        let s = store();
        let plan = [action(vec![uid(10)], ReconciliationAction::Reassign { new_user_id: uid(1) })];
        let mut patch = Row::new();
        patch.insert("user_id".into(), json!(uid(1).to_string()));
        s.update(Table::UserAnalyses, &[Filter::eq("id", uid(10).to_string())], patch)
            .await
            .unwrap();
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert!(report.failed[0].reason.contains("changed since planning"));
    }

    #[tokio::test]
    async fn authorization_denial_stops_the_run() {
        let s = store();
        s.fail_next(Op::Update, Table::UserAnalyses, StoreError::Authorization("rls".into()));
        let plan = [action(
            vec![uid(10), uid(11)],
            ReconciliationAction::Reassign { new_user_id: uid(1) },
        )];
        let err = Executor::new(&s).execute(&plan).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Authorization { .. }));
        assert_eq!(s.calls(Op::Update, Table::UserAnalyses), 1);
    }

    #[tokio::test]
    async fn promotion_copies_then_clears_staging() {
        let s = store();
        s.seed(
            Table::UserAnalysesStaging,
            [json!({"id": uid(10).to_string(), "user_id": uid(1).to_string(), "product_name": "staged"})],
        );
        let plan = [action(
            vec![uid(10)],
            ReconciliationAction::PromoteFromStaging {
                staging_table: Table::UserAnalysesStaging,
            },
        )];
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert_eq!(report.succeeded, vec![uid(10)]);
        let row = s.row_by_id(Table::UserAnalyses, uid(10)).unwrap();
        assert_eq!(row.get("product_name"), Some(&json!("staged")));
        assert_eq!(row.get("user_id"), Some(&json!(uid(1).to_string())));
        assert!(s.row_by_id(Table::UserAnalysesStaging, uid(10)).is_none());
    }

    #[tokio::test]
    async fn failed_staging_delete_is_a_partial_promotion() {
        let s = store();
        s.seed(
            Table::UserAnalysesStaging,
            [json!({"id": uid(10).to_string(), "user_id": uid(1).to_string()})],
        );
        s.fail_next(Op::Delete, Table::UserAnalysesStaging, StoreError::Connection("reset".into()));
        let plan = [action(
            vec![uid(10)],
            ReconciliationAction::PromoteFromStaging {
                staging_table: Table::UserAnalysesStaging,
            },
        )];
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert!(report.succeeded.is_empty());
        assert!(report.failed.is_empty());
        assert!(report.has_partial_promotions());
        assert_eq!(report.partial_promotions[0].record_id, uid(10));
        assert!(s.row_by_id(Table::UserAnalysesStaging, uid(10)).is_some());
        assert!(s.row_by_id(Table::UserAnalyses, uid(10)).is_some());
    }

    #[tokio::test]
    async fn flagged_records_are_reported_not_touched() {
        let s = store();
        let plan = [action(vec![uid(10), uid(11)], ReconciliationAction::FlagForDeletion)];
        let report = Executor::new(&s).execute(&plan).await.unwrap();
        assert_eq!(report.flagged.len(), 2);
        assert_eq!(s.rows(Table::UserAnalyses).len(), 2);
        assert_eq!(s.calls(Op::Delete, Table::UserAnalyses), 0);
        assert_eq!(s.calls(Op::Update, Table::UserAnalyses), 0);
    }
}
