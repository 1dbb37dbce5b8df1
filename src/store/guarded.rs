use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Filter, Query, Store};
use crate::error::StoreError;
use crate::schema::{Row, Table};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts for reads (1 = no retry).
    pub attempts: u32,
    /// Linear backoff unit: attempt n sleeps n * backoff.
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Applies the call timeout to every operation and retries reads on connection errors.
/// Writes are attempted exactly once.
pub struct GuardedStore {
    inner: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.policy.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Connection(format!(
                "call timed out after {:?}",
                self.policy.call_timeout
            ))),
        }
    }

    async fn read<T, F, Fut>(&self, op: &'static str, table: Table, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.policy.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.timed(call()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(target = "store", op, %table, attempt, error = %e, "read failed; retrying");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Store for GuardedStore {
    async fn get(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.read("get", table, || self.inner.get(table, query)).await
    }

    async fn count(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        self.read("count", table, || self.inner.count(table, filters)).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.timed(self.inner.insert(table, row)).await
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.timed(self.inner.upsert(table, row)).await
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<u64, StoreError> {
        self.timed(self.inner.update(table, filters, patch)).await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        self.timed(self.inner.delete(table, filters)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, Op};
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
            call_timeout: Duration::from_millis(200),
        }
    }

    fn seeded() -> Arc<MemoryStore> {
        let mem = Arc::new(MemoryStore::new());
        mem.seed(
            Table::Profiles,
            [json!({"id": "a0000000-0000-0000-0000-000000000001", "email": "a@example.com"})],
        );
        mem
    }

    #[tokio::test]
    async fn reads_retry_connection_errors() {
        let mem = seeded();
        mem.fail_times(Op::Get, Table::Profiles, StoreError::Connection("reset".into()), 2);
        let store = GuardedStore::new(mem.clone(), policy());
        let rows = store.get(Table::Profiles, &Query::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(mem.calls(Op::Get, Table::Profiles), 3);
    }

    #[tokio::test]
    async fn reads_give_up_after_attempt_bound() {
        let mem = seeded();
        mem.fail_times(Op::Count, Table::Profiles, StoreError::Connection("down".into()), 5);
        let store = GuardedStore::new(mem.clone(), policy());
        assert!(store.count(Table::Profiles, &[]).await.is_err());
        assert_eq!(mem.calls(Op::Count, Table::Profiles), 3);
    }

    #[tokio::test]
    async fn authorization_errors_are_not_retried() {
        let mem = seeded();
        mem.fail_next(Op::Get, Table::Profiles, StoreError::Authorization("rls".into()));
        let store = GuardedStore::new(mem.clone(), policy());
        let err = store.get(Table::Profiles, &Query::new()).await.unwrap_err();
        assert!(err.is_authorization());
        assert_eq!(mem.calls(Op::Get, Table::Profiles), 1);
    }

    #[tokio::test]
    async fn writes_are_never_retried() {
        let mem = seeded();
        mem.fail_next(Op::Update, Table::Profiles, StoreError::Connection("reset".into()));
        let store = GuardedStore::new(mem.clone(), policy());
        let patch = json!({"email": "b@example.com"}).as_object().cloned().unwrap();
        let res = store
            .update(
                Table::Profiles,
                &[Filter::eq("id", "a0000000-0000-0000-0000-000000000001")],
                patch,
            )
            .await;
        assert!(matches!(res, Err(StoreError::Connection(_))));
        assert_eq!(mem.calls(Op::Update, Table::Profiles), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_connection_errors() {
        let mem = seeded();
        mem.set_latency(Some(Duration::from_secs(5)));
        let store = GuardedStore::new(
            mem.clone(),
            RetryPolicy {
                attempts: 1,
                backoff: Duration::from_millis(1),
                call_timeout: Duration::from_millis(20),
            },
        );
        let err = store.count(Table::Profiles, &[]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
