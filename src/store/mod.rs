//! Schema accessor: filtered CRUD over the backend tables.
//!
//! Every backend implements [`Store`]. Callers normally hold an
//! `Arc<dyn Store>` produced by [`connect`], which wraps the concrete backend in
//! a [`GuardedStore`] (per-call timeout, read retries).
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::config::{BackendConfig, ReconConfig};
use crate::error::StoreError;
use crate::schema::{Row, Table};

pub mod guarded;
pub mod memory;
pub mod postgres;
pub mod rest;

pub use guarded::{GuardedStore, RetryPolicy};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rest::RestStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Equality; `Value::Null` means IS NULL.
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Case-insensitive SQL LIKE (`%` and `_` wildcards).
    ILike(String, String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn is_in<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn ilike(column: &str, pattern: &str) -> Self {
        Filter::ILike(column.to_string(), pattern.to_string())
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::In(c, _) | Filter::ILike(c, _) => c,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    /// Projection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Ascending order by this column.
    pub order_by: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by = Some(column.to_string());
        self
    }

    pub fn range(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn count(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError>;

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError>;

    /// Insert or overwrite the row with the same `id`.
    async fn upsert(&self, table: Table, row: Row) -> Result<Row, StoreError>;

    /// Returns the number of rows affected.
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<u64, StoreError>;

    /// Returns the number of rows affected.
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError>;
}

/// Writes must always be scoped; the live application shares these tables.
pub(crate) fn ensure_scoped(op: &str, table: Table, filters: &[Filter]) -> Result<(), StoreError> {
    if filters.is_empty() {
        return Err(StoreError::Backend(format!(
            "refusing unfiltered {op} on {table}"
        )));
    }
    Ok(())
}

/// Column names are interpolated into SQL and URLs, so only plain identifiers pass.
pub(crate) fn ensure_ident(column: &str) -> Result<&str, StoreError> {
    let ok = !column.is_empty()
        && column
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && column
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(column)
    } else {
        Err(StoreError::Backend(format!("invalid column name {column:?}")))
    }
}

/// Render a filter value the way both backends compare it (as text).
pub(crate) fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the configured backend, wrapped with timeout and read-retry policy.
pub async fn connect(cfg: &ReconConfig) -> anyhow::Result<Arc<dyn Store>> {
    let policy = RetryPolicy {
        attempts: cfg.read_attempts,
        backoff: cfg.retry_backoff,
        call_timeout: cfg.call_timeout,
    };
    let store: Arc<dyn Store> = match &cfg.backend {
        BackendConfig::Rest { base_url, api_key } => {
            info!(target = "store", backend = "rest", tier = %cfg.tier, "using PostgREST backend");
            Arc::new(RestStore::new(base_url, api_key, cfg.tier, cfg.call_timeout)?)
        }
        BackendConfig::Postgres {
            database_url,
            max_connections,
        } => {
            info!(target = "store", backend = "postgres", tier = %cfg.tier, "using direct Postgres backend");
            Arc::new(PgStore::connect(database_url, *max_connections, cfg.tier).await?)
        }
    };
    Ok(Arc::new(GuardedStore::new(store, policy)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unscoped_writes_are_refused() {
        let err = ensure_scoped("delete", Table::UserAnalyses, &[]).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(ensure_scoped("delete", Table::UserAnalyses, &[Filter::eq("id", "x")]).is_ok());
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(ensure_ident("user_id").is_ok());
        assert!(ensure_ident("_x1").is_ok());
        assert!(ensure_ident("1abc").is_err());
        assert!(ensure_ident("id; drop table profiles").is_err());
        assert!(ensure_ident("UserId").is_err());
    }

    #[test]
    fn query_builder_accumulates() {
        let q = Query::new()
            .filter(Filter::eq("user_id", "abc"))
            .filter(Filter::is_in("id", ["a", "b"]))
            .select(&["id", "user_id"])
            .order_by("id")
            .range(500, 500);
        assert_eq!(q.filters.len(), 2);
        assert_eq!(q.filters[1], Filter::In("id".into(), vec![json!("a"), json!("b")]));
        assert_eq!(q.offset, Some(500));
        assert_eq!(q.columns.as_deref().map(|c| c.len()), Some(2));
    }

    #[test]
    fn value_text_unquotes_strings() {
        assert_eq!(value_text(&json!("abc")), "abc");
        assert_eq!(value_text(&json!(42)), "42");
        assert_eq!(value_text(&json!(true)), "true");
    }
}
