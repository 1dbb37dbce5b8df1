//! Turns orphan entries into repair actions.
//!
//! Precedence per entry: explicit operator remap, then staging promotion, then
//! a flag for manual deletion. Nothing here writes.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use super::advisory::AdvisoryHint;
use super::index::OrphanEntry;
use crate::error::StoreError;
use crate::schema::{RecordTable, Table};
use crate::store::{Filter, Query, Store};

/// Staging lookups are issued in chunks of this many ids.
const STAGING_CHUNK: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReconciliationAction {
    #[serde(rename_all = "camelCase")]
    Reassign { new_user_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PromoteFromStaging { staging_table: Table },
    FlagForDeletion,
}

/// One action over a set of records captured at planning time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    pub table: RecordTable,
    /// The orphaned reference being repaired (`None` = NULL / malformed).
    pub user_id: Option<Uuid>,
    pub record_ids: Vec<Uuid>,
    pub action: ReconciliationAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisory: Vec<AdvisoryHint>,
}

/// Operator-supplied `old user id -> new user id` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemapTable(BTreeMap<Uuid, Uuid>);

impl RemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old: Uuid, new: Uuid) {
        self.0.insert(old, new);
    }

    pub fn get(&self, old: &Uuid) -> Option<Uuid> {
        self.0.get(old).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `OLD=NEW` arguments.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> anyhow::Result<Self> {
        let mut out = Self::new();
        for raw in pairs {
            let raw = raw.as_ref();
            let (old, new) = raw
                .split_once('=')
                .ok_or_else(|| anyhow!("remap {raw:?} is not OLD=NEW"))?;
            out.insert(parse_id(old)?, parse_id(new)?);
        }
        Ok(out)
    }

    /// Parse a JSON object `{"old": "new", ...}`.
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let map: HashMap<String, String> =
            serde_json::from_str(content).context("remap file must be a JSON object of uuid strings")?;
        let mut out = Self::new();
        for (old, new) in map {
            out.insert(parse_id(&old)?, parse_id(&new)?);
        }
        Ok(out)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading remap file {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn merge(&mut self, other: RemapTable) {
        self.0.extend(other.0);
    }
}

fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("{raw:?} is not a uuid"))
}

pub struct Planner<'a> {
    store: &'a dyn Store,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(table = %table, orphans = orphans.len()))]
    pub async fn plan(
        &self,
        table: RecordTable,
        orphans: &[OrphanEntry],
        known_profiles: &HashSet<Uuid>,
        remap: &RemapTable,
    ) -> Result<Vec<PlannedAction>, StoreError> {
        let mut plan = Vec::with_capacity(orphans.len());
        for entry in orphans {
            let base = |record_ids: Vec<Uuid>, action, note: Option<String>| PlannedAction {
                table,
                user_id: entry.user_id,
                record_ids,
                action,
                note,
                advisory: Vec::new(),
            };

            if let Some(target) = entry.user_id.and_then(|u| remap.get(&u)) {
                if known_profiles.contains(&target) {
                    plan.push(base(
                        entry.affected_record_ids.clone(),
                        ReconciliationAction::Reassign { new_user_id: target },
                        None,
                    ));
                } else {
                    plan.push(base(
                        entry.affected_record_ids.clone(),
                        ReconciliationAction::FlagForDeletion,
                        Some(format!("remap target {target} is not an existing profile")),
                    ));
                }
                continue;
            }

            let promotable = match table.staging() {
                Some(staging) => {
                    self.promotable_ids(staging, &entry.affected_record_ids, known_profiles)
                        .await?
                }
                None => HashSet::new(),
            };
            let (promote, rest): (Vec<Uuid>, Vec<Uuid>) = entry
                .affected_record_ids
                .iter()
                .copied()
                .partition(|id| promotable.contains(id));

            if let Some(staging) = table.staging().filter(|_| !promote.is_empty()) {
                plan.push(base(
                    promote,
                    ReconciliationAction::PromoteFromStaging {
                        staging_table: staging,
                    },
                    None,
                ));
            }
            if !rest.is_empty() {
                plan.push(base(rest, ReconciliationAction::FlagForDeletion, None));
            }
        }
        info!(actions = plan.len(), "reconciliation plan ready");
        Ok(plan)
    }

    /// Ids present in `staging` whose staged `user_id` names a known profile.
    async fn promotable_ids(
        &self,
        staging: Table,
        ids: &[Uuid],
        known_profiles: &HashSet<Uuid>,
    ) -> Result<HashSet<Uuid>, StoreError> {
        let mut out = HashSet::new();
        for chunk in ids.chunks(STAGING_CHUNK) {
            let query = Query::new()
                .filter(Filter::is_in("id", chunk.iter().map(|id| id.to_string())))
                .select(&["id", "user_id"]);
            for row in self.store.get(staging, &query).await? {
                let id = row.get("id").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok());
                let user = row
                    .get("user_id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                if let (Some(id), Some(user)) = (id, user) {
                    if known_profiles.contains(&user) {
                        out.insert(id);
                    }
                }
            }
        }
        Ok(out)
    }
}
