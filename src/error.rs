use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::Table;

/// Failure of a single call against the backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transport failure, timeout or transient backend outage. Reads may retry.
    #[error("connection error: {0}")]
    Connection(String),
    /// Row-level-security or privilege denial. Never retried.
    #[error("authorization denied: {0}")]
    Authorization(String),
    /// Unique / foreign-key violation on a write.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Anything else the backend rejected (bad payload, malformed response, unscoped write).
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, StoreError::Authorization(_))
    }
}

/// The staging row was copied into the primary table but could not be removed
/// afterwards. Both copies now exist; the operator must resolve it by hand.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("staging row {record_id} was copied into {primary_table} but is still present in {staging_table}: {reason}")]
pub struct PartialPromotionError {
    pub record_id: Uuid,
    pub staging_table: Table,
    pub primary_table: Table,
    pub reason: String,
}

/// Setup-level problems with a CSV export (data-level problems are reported as invalid rows).
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("csv header has no `{0}` column")]
    MissingColumn(String),
    #[error("csv input is empty")]
    Empty,
    #[error("csv read failed: {0}")]
    Read(#[from] csv::Error),
}

/// Errors that stop a reconciliation run as a whole.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("authorization denied during {operation}: {source}")]
    Authorization {
        operation: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Csv(#[from] CsvError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
