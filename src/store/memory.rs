//! In-process store with scripted faults. Backs the test suite and local dry runs.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;
use uuid::Uuid;

use super::{ensure_scoped, value_text, Filter, Query, Store};
use crate::error::StoreError;
use crate::schema::{Row, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Count,
    Insert,
    Upsert,
    Update,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    table: Table,
    error: StoreError,
    remaining: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<(Op, Table), usize>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table from JSON objects; non-object values are ignored.
    pub fn seed<I>(&self, table: Table, rows: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let entry = tables.entry(table).or_default();
        entry.extend(rows.into_iter().filter_map(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        }));
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn row_by_id(&self, table: Table, id: Uuid) -> Option<Row> {
        let id = id.to_string();
        self.rows(table)
            .into_iter()
            .find(|r| r.get("id").map(value_text).as_deref() == Some(id.as_str()))
    }

    /// Make the next call of `op` on `table` fail with `error`.
    pub fn fail_next(&self, op: Op, table: Table, error: StoreError) {
        self.fail_times(op, table, error, 1);
    }

    pub fn fail_times(&self, op: Op, table: Table, error: StoreError, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.push(Fault {
            op,
            table,
            error,
            remaining: times,
        });
    }

    /// Delay every call by `latency` (used to exercise call timeouts).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Number of calls observed for `op` on `table`, including failed ones.
    pub fn calls(&self, op: Op, table: Table) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
        calls.get(&(op, table)).copied().unwrap_or(0)
    }

    async fn enter(&self, op: Op, table: Table) -> Result<(), StoreError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
            *calls.entry((op, table)).or_default() += 1;
        }
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(pos) = faults
            .iter()
            .position(|f| f.op == op && f.table == table && f.remaining > 0)
        {
            let fault = &mut faults[pos];
            fault.remaining -= 1;
            let err = fault.error.clone();
            if fault.remaining == 0 {
                faults.remove(pos);
            }
            return Err(err);
        }
        Ok(())
    }

    fn with_rows<T>(&self, table: Table, f: impl FnOnce(&mut Vec<Row>) -> T) -> T {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        f(tables.entry(table).or_default())
    }
}

fn matches(row: &Row, filters: &[Filter]) -> Result<bool, StoreError> {
    for f in filters {
        let cell = row.get(f.column()).filter(|v| !v.is_null());
        let hit = match f {
            Filter::Eq(_, Value::Null) => cell.is_none(),
            Filter::Eq(_, v) => cell.is_some_and(|c| value_text(c) == value_text(v)),
            Filter::In(_, vs) => {
                cell.is_some_and(|c| vs.iter().any(|v| value_text(c) == value_text(v)))
            }
            Filter::ILike(_, pattern) => {
                let re = RegexBuilder::new(&like_to_regex(pattern))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| StoreError::Backend(format!("bad ilike pattern: {e}")))?;
                cell.is_some_and(|c| re.is_match(&value_text(c)))
            }
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn row_id(row: &Row) -> Option<String> {
    row.get("id").filter(|v| !v.is_null()).map(value_text)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.enter(Op::Get, table).await?;
        let mut hits = Vec::new();
        for row in self.rows(table) {
            if matches(&row, &query.filters)? {
                hits.push(row);
            }
        }
        if let Some(col) = &query.order_by {
            hits.sort_by_key(|r| r.get(col).map(value_text).unwrap_or_default());
        }
        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let page = hits.into_iter().skip(offset).take(limit);
        Ok(match &query.columns {
            Some(cols) => page
                .map(|r| {
                    r.into_iter()
                        .filter(|(k, _)| cols.iter().any(|c| c == k))
                        .collect()
                })
                .collect(),
            None => page.collect(),
        })
    }

    async fn count(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        self.enter(Op::Count, table).await?;
        let mut n = 0u64;
        for row in self.rows(table) {
            if matches(&row, filters)? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn insert(&self, table: Table, mut row: Row) -> Result<Row, StoreError> {
        self.enter(Op::Insert, table).await?;
        if row_id(&row).is_none() {
            row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        self.with_rows(table, |rows| {
            let id = row_id(&row);
            if rows.iter().any(|r| row_id(r) == id) {
                return Err(StoreError::Constraint(format!(
                    "duplicate key value violates unique constraint \"{table}_pkey\""
                )));
            }
            rows.push(row.clone());
            Ok(row)
        })
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.enter(Op::Upsert, table).await?;
        let id = row_id(&row)
            .ok_or_else(|| StoreError::Backend(format!("upsert into {table} without id")))?;
        Ok(self.with_rows(table, |rows| {
            match rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id.as_str())) {
                Some(existing) => {
                    existing.extend(row);
                    existing.clone()
                }
                None => {
                    rows.push(row.clone());
                    row
                }
            }
        }))
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<u64, StoreError> {
        ensure_scoped("update", table, filters)?;
        self.enter(Op::Update, table).await?;
        self.with_rows(table, |rows| {
            let hits = rows
                .iter()
                .map(|r| matches(r, filters))
                .collect::<Result<Vec<bool>, _>>()?;
            let mut n = 0u64;
            for (row, hit) in rows.iter_mut().zip(hits) {
                if hit {
                    row.extend(patch.clone());
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        ensure_scoped("delete", table, filters)?;
        self.enter(Op::Delete, table).await?;
        self.with_rows(table, |rows| {
            let doomed = rows
                .iter()
                .map(|r| matches(r, filters))
                .collect::<Result<Vec<bool>, _>>()?;
            let before = rows.len();
            let mut flags = doomed.into_iter();
            rows.retain(|_| !flags.next().unwrap_or(false));
            Ok((before - rows.len()) as u64)
        })
    }
}
