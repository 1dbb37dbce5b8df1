//! Direct Postgres backend (Supabase database DSN) built on sqlx.
//!
//! Rows are moved as `jsonb`: reads project `to_jsonb(t)`, writes go through
//! `jsonb_populate_record` so column types are resolved by the database.
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, instrument};

use super::{ensure_ident, ensure_scoped, value_text, Filter, Query, Store};
use crate::config::CredentialTier;
use crate::error::StoreError;
use crate::schema::{Row, Table};

#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        tier: CredentialTier,
    ) -> anyhow::Result<Self> {
        // PgBouncer txn mode safe
        let mut connect_options =
            PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        let read_only = tier == CredentialTier::ReadOnly;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET application_name = 'skincare_recon'")
                        .persistent(false)
                        .execute(&mut *conn)
                        .await?;
                    if read_only {
                        sqlx::query("SET default_transaction_read_only = on")
                            .persistent(false)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;
        info!(read_only, "connected to db");
        Ok(Self { pool })
    }
}

fn quoted(column: &str) -> Result<String, StoreError> {
    Ok(format!("\"{}\"", ensure_ident(column)?))
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) -> Result<(), StoreError> {
    for (i, f) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        let col = quoted(f.column())?;
        match f {
            Filter::Eq(_, Value::Null) => {
                qb.push(format!("t.{col} IS NULL"));
            }
            Filter::Eq(_, v) => {
                qb.push(format!("t.{col}::text = "));
                qb.push_bind(value_text(v));
            }
            Filter::In(_, vs) => {
                qb.push(format!("t.{col}::text = ANY("));
                qb.push_bind(vs.iter().map(value_text).collect::<Vec<String>>());
                qb.push(")");
            }
            Filter::ILike(_, pattern) => {
                qb.push(format!("t.{col}::text ILIKE "));
                qb.push_bind(pattern.clone());
            }
        }
    }
    Ok(())
}

fn column_list(row: &Row) -> Result<Vec<String>, StoreError> {
    if row.is_empty() {
        return Err(StoreError::Backend("empty row".into()));
    }
    row.keys().map(|k| quoted(k)).collect()
}

fn into_row(v: Value) -> Result<Row, StoreError> {
    match v {
        Value::Object(m) => Ok(m),
        other => Err(StoreError::Backend(format!("expected jsonb object, got {other}"))),
    }
}

/// Map sqlx failures onto the store taxonomy by SQLSTATE.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                // insufficient_privilege, read_only_sql_transaction
                "42501" | "25006" => StoreError::Authorization(db.message().to_string()),
                c if c.starts_with("23") => StoreError::Constraint(db.message().to_string()),
                c if c.starts_with("08") || c.starts_with("57P") => {
                    StoreError::Connection(db.message().to_string())
                }
                _ => StoreError::Backend(format!("{code}: {}", db.message())),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, query), fields(table = %table))]
    async fn get(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM public.");
        qb.push(table.name()).push(" AS t");
        push_where(&mut qb, &query.filters)?;
        if let Some(col) = &query.order_by {
            qb.push(format!(" ORDER BY t.{}", quoted(col)?));
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            qb.push(" OFFSET ").push_bind(offset as i64);
        }
        let values: Vec<Value> = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        let mut rows = Vec::with_capacity(values.len());
        for v in values {
            let mut row = into_row(v)?;
            if let Some(cols) = &query.columns {
                row.retain(|k, _| cols.iter().any(|c| c == k));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    #[instrument(skip(self, filters), fields(table = %table))]
    async fn count(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::BIGINT FROM public.");
        qb.push(table.name()).push(" AS t");
        push_where(&mut qb, filters)?;
        let n: i64 = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(n.max(0) as u64)
    }

    #[instrument(skip(self, row), fields(table = %table))]
    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let cols = column_list(&row)?.join(", ");
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO public.");
        qb.push(format!("{} AS t ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::public.{}, ", table.name(), table.name()));
        qb.push_bind(Value::Object(row));
        qb.push(") RETURNING to_jsonb(t)");
        let v: Value = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        into_row(v)
    }

    #[instrument(skip(self, row), fields(table = %table))]
    async fn upsert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        if !row.contains_key("id") {
            return Err(StoreError::Backend(format!("upsert into {table} without id")));
        }
        let col_names = column_list(&row)?;
        let cols = col_names.join(", ");
        let updates = col_names
            .iter()
            .filter(|c| c.as_str() != "\"id\"")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>();
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO public.");
        qb.push(format!("{} AS t ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::public.{}, ", table.name(), table.name()));
        qb.push_bind(Value::Object(row));
        if updates.is_empty() {
            qb.push(") ON CONFLICT (\"id\") DO NOTHING RETURNING to_jsonb(t)");
        } else {
            qb.push(format!(") ON CONFLICT (\"id\") DO UPDATE SET {} RETURNING to_jsonb(t)", updates.join(", ")));
        }
        let v: Option<Value> = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        match v {
            Some(v) => into_row(v),
            None => Err(StoreError::Backend(format!("upsert into {table} returned no row"))),
        }
    }

    #[instrument(skip(self, filters, patch), fields(table = %table))]
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<u64, StoreError> {
        ensure_scoped("update", table, filters)?;
        let sets = column_list(&patch)?
            .into_iter()
            .map(|c| format!("{c} = r.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE public.");
        qb.push(format!("{} AS t SET {sets} FROM jsonb_populate_record(NULL::public.{}, ", table.name(), table.name()));
        qb.push_bind(Value::Object(patch));
        qb.push(") AS r");
        push_where(&mut qb, filters)?;
        let done = qb
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(done.rows_affected())
    }

    #[instrument(skip(self, filters), fields(table = %table))]
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        ensure_scoped("delete", table, filters)?;
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM public.");
        qb.push(table.name()).push(" AS t");
        push_where(&mut qb, filters)?;
        let done = qb
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(done.rows_affected())
    }
}
