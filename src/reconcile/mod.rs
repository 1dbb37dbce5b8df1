//! Identity reconciliation workflow: audit, plan, repair.
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::config::ReconConfig;
use crate::error::{ReconcileError, StoreError};
use crate::schema::RecordTable;
use crate::store::Store;

pub mod advisory;
pub mod csv_ingest;
pub mod executor;
pub mod index;
pub mod planner;

pub use executor::{Executor, RepairReport};
pub use index::{IdentityIndex, IndexBuilder, OrphanEntry};
pub use planner::{PlannedAction, Planner, ReconciliationAction, RemapTable};

/// Outcome of one pass over a table. `report` is `None` for plan-only runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub index: IdentityIndex,
    pub plan: Vec<PlannedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RepairReport>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    page_size: u64,
    advisory_threshold: f64,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, cfg: &ReconConfig) -> Self {
        Self::with_options(store, cfg.page_size, cfg.advisory_threshold)
    }

    pub fn with_options(store: Arc<dyn Store>, page_size: u64, advisory_threshold: f64) -> Self {
        Self {
            store,
            page_size,
            advisory_threshold,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub async fn audit(&self, table: RecordTable) -> Result<IdentityIndex, ReconcileError> {
        IndexBuilder::new(self.store(), self.page_size)
            .build(table)
            .await
            .map_err(setup_error("audit"))
    }

    pub async fn plan(
        &self,
        index: &IdentityIndex,
        remap: &RemapTable,
    ) -> Result<Vec<PlannedAction>, ReconcileError> {
        let mut plan = Planner::new(self.store())
            .plan(index.table, &index.orphaned, &index.known_profiles(), remap)
            .await
            .map_err(setup_error("plan"))?;
        advisory::annotate(&mut plan, index, self.advisory_threshold);
        Ok(plan)
    }

    pub async fn repair(&self, plan: &[PlannedAction]) -> Result<RepairReport, ReconcileError> {
        Executor::new(self.store()).execute(plan).await
    }

    /// Audit `table`, plan against `remap`, and execute the plan when `execute` is set.
    #[instrument(skip(self, remap), fields(remaps = remap.len()))]
    pub async fn run(
        &self,
        table: RecordTable,
        remap: &RemapTable,
        execute: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let index = self.audit(table).await?;
        let plan = self.plan(&index, remap).await?;
        let report = if execute {
            Some(self.repair(&plan).await?)
        } else {
            info!(%table, actions = plan.len(), "plan only; nothing written");
            None
        };
        Ok(ReconcileOutcome {
            index,
            plan,
            report,
        })
    }
}

/// Reads that fail during audit or planning halt the run; denials keep their own variant.
fn setup_error(operation: &'static str) -> impl Fn(StoreError) -> ReconcileError {
    move |e| {
        if e.is_authorization() {
            ReconcileError::Authorization {
                operation: operation.to_string(),
                source: e,
            }
        } else {
            ReconcileError::Store(e)
        }
    }
}
