//! Identity index: which `user_id` references resolve to a profile and which are orphaned.
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::schema::{RecordRef, RecordTable, Row, Table};
use crate::store::{value_text, Query, Store};

/// Records sharing one unresolvable `user_id`. `user_id == None` groups rows whose
/// reference is NULL or not a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanEntry {
    pub user_id: Option<Uuid>,
    pub affected_record_ids: Vec<Uuid>,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityIndex {
    pub table: RecordTable,
    pub matched: usize,
    pub orphaned: Vec<OrphanEntry>,
    pub total_profiles: usize,
    pub total_records: usize,
    /// profile id -> email
    pub profile_emails: BTreeMap<Uuid, String>,
    /// user id -> number of records referencing it (resolved or not)
    pub record_counts: BTreeMap<Uuid, usize>,
    /// Labels of matched records per owning profile.
    #[serde(skip)]
    pub labels_by_user: BTreeMap<Uuid, Vec<String>>,
    /// Labels of orphaned records.
    #[serde(skip)]
    pub orphan_labels: BTreeMap<Uuid, String>,
}

impl IdentityIndex {
    pub fn orphaned_record_count(&self) -> usize {
        self.orphaned.iter().map(|o| o.record_count).sum()
    }

    pub fn known_profiles(&self) -> HashSet<Uuid> {
        self.profile_emails.keys().copied().collect()
    }
}

/// Scan a table in pages ordered by `id`.
///
/// The initial exact count bounds the scan. A short page only ends it once that
/// many distinct rows have been fetched; otherwise the backend is capping rows
/// per response, and paging continues at the smaller size. Rows are
/// deduplicated by `id`. The scan runs at most `ceil(count / page_size) + 1`
/// pages (recomputed when the page size shrinks) and fails if that cap is hit
/// with rows still missing. An empty page means rows were deleted mid-scan and
/// ends it with a warning.
pub async fn scan_table(
    store: &dyn Store,
    table: Table,
    columns: &[&str],
    page_size: u64,
) -> Result<Vec<Row>, StoreError> {
    let mut page_size = page_size.max(1);
    let total = store.count(table, &[]).await?;
    let mut max_pages = total.div_ceil(page_size) + 1;
    let mut out: Vec<Row> = Vec::with_capacity(total as usize);
    let mut seen: HashSet<String> = HashSet::with_capacity(total as usize);
    let mut offset = 0u64;
    let mut page = 0u64;
    while (out.len() as u64) < total || page == 0 {
        if page >= max_pages {
            warn!(%table, pages = page, total, fetched = out.len(), "page cap reached");
            return Err(StoreError::Backend(format!(
                "scan of {table} truncated: fetched {} of {total} rows in {page} pages",
                out.len()
            )));
        }
        let query = Query::new()
            .select(columns)
            .order_by("id")
            .range(offset, page_size);
        let rows = store.get(table, &query).await?;
        let n = rows.len() as u64;
        page += 1;
        offset += n;
        for row in rows {
            let id = row.get("id").map(value_text).unwrap_or_default();
            if seen.insert(id) {
                out.push(row);
            }
        }
        debug!(%table, page, rows = n, fetched = out.len(), "page fetched");
        if n == 0 {
            if (out.len() as u64) < total {
                // Rows counted up front were deleted while we paged.
                warn!(%table, total, fetched = out.len(), "table shrank during scan");
            }
            break;
        }
        if n < page_size && (out.len() as u64) < total {
            let remaining = total - out.len() as u64;
            warn!(%table, requested = page_size, returned = n, "backend caps page size; continuing");
            page_size = n;
            max_pages = page + remaining.div_ceil(n) + 1;
        }
    }
    Ok(out)
}

pub struct IndexBuilder<'a> {
    store: &'a dyn Store,
    page_size: u64,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(store: &'a dyn Store, page_size: u64) -> Self {
        Self { store, page_size }
    }

    async fn profile_emails(&self) -> Result<BTreeMap<Uuid, String>, StoreError> {
        let rows = scan_table(self.store, Table::Profiles, &["id", "email"], self.page_size).await?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let r = RecordRef::from_row(row, "email")?;
            out.insert(r.id, r.label.unwrap_or_default());
        }
        Ok(out)
    }

    /// Full audit of `table` against `profiles`.
    #[instrument(skip(self))]
    pub async fn build(&self, table: RecordTable) -> Result<IdentityIndex, StoreError> {
        let label = table.label_column();
        let rows = scan_table(
            self.store,
            table.table(),
            &["id", "user_id", label],
            self.page_size,
        )
        .await?;
        let records = rows
            .iter()
            .map(|r| RecordRef::from_row(r, label))
            .collect::<Result<Vec<_>, _>>()?;
        let emails = self.profile_emails().await?;
        let index = assemble(table, records, emails);
        info!(
            %table,
            records = index.total_records,
            matched = index.matched,
            orphaned = index.orphaned_record_count(),
            profiles = index.total_profiles,
            "identity index built"
        );
        Ok(index)
    }

    /// Audit externally supplied `(record id, user id)` pairs, e.g. validated CSV rows.
    pub async fn build_from_pairs(
        &self,
        table: RecordTable,
        pairs: &[(Uuid, Uuid)],
    ) -> Result<IdentityIndex, StoreError> {
        let records = pairs
            .iter()
            .map(|&(id, user_id)| RecordRef {
                id,
                user_id: Some(user_id),
                label: None,
            })
            .collect();
        let emails = self.profile_emails().await?;
        Ok(assemble(table, records, emails))
    }
}

/// Partition records into matched / orphaned. Every record lands in exactly one side.
pub fn assemble(
    table: RecordTable,
    records: Vec<RecordRef>,
    profile_emails: BTreeMap<Uuid, String>,
) -> IdentityIndex {
    let total_records = records.len();
    let mut matched = 0usize;
    let mut record_counts: BTreeMap<Uuid, usize> = BTreeMap::new();
    let mut labels_by_user: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
    let mut orphan_labels = BTreeMap::new();
    let mut orphans: BTreeMap<Option<Uuid>, Vec<Uuid>> = BTreeMap::new();

    for rec in records {
        if let Some(uid) = rec.user_id {
            *record_counts.entry(uid).or_default() += 1;
        }
        match rec.user_id {
            Some(uid) if profile_emails.contains_key(&uid) => {
                matched += 1;
                if let Some(l) = rec.label {
                    labels_by_user.entry(uid).or_default().push(l);
                }
            }
            other => {
                if let Some(l) = rec.label {
                    orphan_labels.insert(rec.id, l);
                }
                orphans.entry(other).or_default().push(rec.id);
            }
        }
    }

    let orphaned = orphans
        .into_iter()
        .map(|(user_id, mut ids)| {
            ids.sort();
            OrphanEntry {
                user_id,
                record_count: ids.len(),
                affected_record_ids: ids,
            }
        })
        .collect();

    IdentityIndex {
        table,
        matched,
        orphaned,
        total_profiles: profile_emails.len(),
        total_records,
        profile_emails,
        record_counts,
        labels_by_user,
        orphan_labels,
    }
}
