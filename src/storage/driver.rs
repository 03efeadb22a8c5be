//! Revisioned store driver.
//!
//! The driver is the only component that issues SQL against the revision
//! table. Writes run through a bounded linear-backoff retry loop and, for
//! dialects that need it, through a per-driver write coordinator.

use super::dialect::{Dialect, InsertStrategy};
use super::statements::{prefix_pattern, strip_whitespace, ListSpec, Statements, GAP_KEY_PREFIX};
use crate::core::config::StorageConfig;
use crate::core::error::{StrataError, StrataResult};
use crate::mvcc::record::Record;
use sqlx::any::{AnyArguments, AnyQueryResult};
use sqlx::AnyPool;
use sqlx::query::Query;
use sqlx::{Any, Row};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Bounded retry for writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Backoff grows by this step after each failed attempt.
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            step: Duration::from_millis(10),
        }
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            attempts: config.write_retry_attempts.max(1),
            step: config.write_retry_backoff(),
        }
    }
}

/// Serializes writers for engines without their own writer concurrency.
///
/// Owned by a single driver so independent stores in one process never
/// contend with each other.
#[derive(Debug, Default)]
pub struct WriteCoordinator {
    lock: Option<Mutex<()>>,
}

impl WriteCoordinator {
    /// Create a coordinator; `serialize == false` makes `acquire` free.
    pub fn new(serialize: bool) -> Self {
        Self {
            lock: serialize.then(|| Mutex::new(())),
        }
    }

    /// Whether writes are serialized.
    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    /// Take the write lock if this coordinator serializes writes.
    pub async fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }
}

/// A bound statement parameter.
#[derive(Debug, Clone, Copy)]
enum Arg<'a> {
    Int(i64),
    Text(&'a str),
    Bytes(Option<&'a [u8]>),
}

fn bind<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &[Arg<'q>],
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match *arg {
            Arg::Int(v) => query.bind(v),
            Arg::Text(v) => query.bind(v),
            Arg::Bytes(v) => query.bind(v.map(|b| b.to_vec())),
        };
    }
    query
}

/// Fields of a record about to be appended.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewRecord<'a> {
    pub name: &'a str,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Option<&'a [u8]>,
    pub old_value: Option<&'a [u8]>,
}

/// SQL driver over the single revision table.
#[derive(Debug, Clone)]
pub struct Driver {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    statements: Arc<Statements>,
    coordinator: Arc<WriteCoordinator>,
    retry: RetryPolicy,
}

impl Driver {
    /// Build a driver over an open pool.
    pub fn new(pool: AnyPool, dialect: Arc<dyn Dialect>, retry: RetryPolicy) -> Self {
        let statements = Arc::new(Statements::new(dialect.as_ref()));
        let coordinator = Arc::new(WriteCoordinator::new(dialect.serialize_writes()));
        Self {
            pool,
            dialect,
            statements,
            coordinator,
            retry,
        }
    }

    /// The dialect this driver speaks.
    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// The write coordinator shared by clones of this driver.
    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.coordinator
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create the table and indexes if absent.
    pub async fn setup_schema(&self) -> StrataResult<()> {
        for statement in self.dialect.schema() {
            tracing::trace!(sql = %strip_whitespace(statement), "schema");
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!(dialect = self.dialect.name(), "schema ready");
        Ok(())
    }

    /// Run a write with bounded retry under the write coordinator.
    async fn write<T, F, Fut>(&self, sql: &str, mut op: F) -> StrataResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _guard = self.coordinator.acquire().await;
        let mut attempt = 1;
        loop {
            tracing::trace!(sql = %strip_whitespace(sql), attempt, "exec");
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry.attempts && self.dialect.is_retryable(&err) => {
                    tracing::debug!(error = %err, attempt, "retrying write");
                    tokio::time::sleep(self.retry.step * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(StrataError::Storage(err)),
            }
        }
    }

    async fn execute(&self, sql: &str, args: &[Arg<'_>]) -> StrataResult<AnyQueryResult> {
        self.write(sql, || bind(sqlx::query(sql), args).execute(&self.pool))
            .await
    }

    async fn fetch_records(&self, sql: &str, args: &[Arg<'_>]) -> StrataResult<Vec<Record>> {
        tracing::trace!(sql = %strip_whitespace(sql), "query");
        let rows = bind(sqlx::query(sql), args).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Record::from_row(row).map_err(StrataError::from))
            .collect()
    }

    async fn fetch_i64(&self, sql: &str, args: &[Arg<'_>]) -> StrataResult<Option<i64>> {
        tracing::trace!(sql = %strip_whitespace(sql), "query");
        let row = bind(sqlx::query(sql), args)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<i64>, _>(0)?),
            None => Ok(None),
        }
    }

    /// Append one record and return its id.
    pub async fn insert(&self, record: NewRecord<'_>) -> StrataResult<i64> {
        let args = [
            Arg::Text(record.name),
            Arg::Int(record.created as i64),
            Arg::Int(record.deleted as i64),
            Arg::Int(record.create_revision),
            Arg::Int(record.prev_revision),
            Arg::Int(record.lease),
            Arg::Bytes(record.value),
            Arg::Bytes(record.old_value),
        ];
        let sql = self.statements.insert.as_str();
        match self.dialect.insert_strategy() {
            InsertStrategy::Returning => {
                let row = self
                    .write(sql, || bind(sqlx::query(sql), &args).fetch_one(&self.pool))
                    .await?;
                Ok(row.try_get::<i64, _>(0)?)
            }
            InsertStrategy::LastInsertId => {
                let result = self.execute(sql, &args).await?;
                result
                    .last_insert_id()
                    .ok_or_else(|| StrataError::internal("driver did not report an insert id"))
            }
        }
    }

    /// `MAX(id)` over the whole table, 0 when empty.
    pub async fn current_revision(&self) -> StrataResult<i64> {
        Ok(self
            .fetch_i64(&self.statements.current_revision, &[])
            .await?
            .unwrap_or(0))
    }

    /// Stored compaction revision, 0 if never written.
    pub async fn compact_revision(&self) -> StrataResult<i64> {
        Ok(self
            .fetch_i64(&self.statements.compact_revision, &[])
            .await?
            .unwrap_or(0))
    }

    /// Raise the sentinel's compaction revision, creating the sentinel if
    /// absent. Never moves the stored value backwards.
    pub async fn set_compact_revision(&self, revision: i64) -> StrataResult<()> {
        let sql = &self.statements.update_compact;
        let result = self
            .execute(sql, &[Arg::Int(revision), Arg::Int(revision)])
            .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        if self.sentinel_rows().await?.is_empty() {
            self.insert_sentinel(revision).await?;
        }
        Ok(())
    }

    /// Append a fresh sentinel row.
    pub async fn insert_sentinel(&self, revision: i64) -> StrataResult<()> {
        let sql = &self.statements.insert_compact;
        self.execute(sql, &[Arg::Int(revision)]).await?;
        Ok(())
    }

    /// `(id, compact revision)` of every sentinel row, highest revision first.
    pub async fn sentinel_rows(&self) -> StrataResult<Vec<(i64, i64)>> {
        let sql = &self.statements.sentinel_rows;
        tracing::trace!(sql = %strip_whitespace(sql), "query");
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok((row.try_get::<i64, _>(0)?, row.try_get::<i64, _>(1)?)))
            .collect()
    }

    /// Newest record of `name`, optionally as of `revision`.
    pub async fn latest(&self, name: &str, revision: Option<i64>) -> StrataResult<Option<Record>> {
        let records = match revision {
            Some(rev) => {
                self.fetch_records(
                    &self.statements.get_latest_at,
                    &[Arg::Text(name), Arg::Int(rev)],
                )
                .await?
            }
            None => {
                self.fetch_records(&self.statements.get_latest, &[Arg::Text(name)])
                    .await?
            }
        };
        Ok(records.into_iter().next())
    }

    /// Newest record of every key under `prefix`, ordered by key.
    pub async fn list_current(
        &self,
        prefix: &str,
        start_key: Option<&str>,
        limit: i64,
        include_deleted: bool,
    ) -> StrataResult<Vec<Record>> {
        self.list(prefix, start_key, None, limit, include_deleted)
            .await
    }

    /// Like [`Driver::list_current`], considering only records with
    /// `id <= revision`.
    pub async fn list_after(
        &self,
        prefix: &str,
        start_key: Option<&str>,
        revision: i64,
        limit: i64,
        include_deleted: bool,
    ) -> StrataResult<Vec<Record>> {
        self.list(prefix, start_key, Some(revision), limit, include_deleted)
            .await
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: Option<&str>,
        revision: Option<i64>,
        limit: i64,
        include_deleted: bool,
    ) -> StrataResult<Vec<Record>> {
        let spec = ListSpec {
            after_key: start_key.is_some(),
            at_revision: revision.is_some(),
            include_deleted,
            limited: limit > 0,
        };
        let sql = self.statements.list(self.dialect.as_ref(), spec);
        let pattern = prefix_pattern(prefix);

        let mut args = vec![Arg::Text(&pattern)];
        if let Some(key) = start_key {
            args.push(Arg::Text(key));
        }
        if let Some(rev) = revision {
            args.push(Arg::Int(rev));
        }
        if limit > 0 {
            args.push(Arg::Int(limit));
        }
        self.fetch_records(&sql, &args).await
    }

    /// Every record under `prefix` with `id > after`, ascending by id.
    pub async fn list_since(&self, prefix: &str, after: i64, limit: i64) -> StrataResult<Vec<Record>> {
        let pattern = prefix_pattern(prefix);
        if limit > 0 {
            self.fetch_records(
                &self.statements.after_limited,
                &[Arg::Text(&pattern), Arg::Int(after), Arg::Int(limit)],
            )
            .await
        } else {
            self.fetch_records(
                &self.statements.after,
                &[Arg::Text(&pattern), Arg::Int(after)],
            )
            .await
        }
    }

    /// Current revision and number of live keys under `prefix`.
    pub async fn count(&self, prefix: &str, revision: Option<i64>) -> StrataResult<(i64, i64)> {
        let sql = self.statements.count(self.dialect.as_ref(), revision.is_some());
        let pattern = prefix_pattern(prefix);
        let mut args = vec![Arg::Text(&pattern)];
        if let Some(rev) = revision {
            args.push(Arg::Int(rev));
        }
        let count = self.fetch_i64(&sql, &args).await?.unwrap_or(0);
        let current = self.current_revision().await?;
        Ok((current, count))
    }

    /// Hard-delete exactly one record.
    pub async fn delete_revision(&self, id: i64) -> StrataResult<()> {
        self.execute(&self.statements.delete_revision, &[Arg::Int(id)])
            .await?;
        Ok(())
    }

    /// Delete superseded records below `revision`; returns rows removed.
    pub async fn compact(&self, revision: i64) -> StrataResult<u64> {
        let result = self
            .execute(
                &self.statements.compact,
                &[Arg::Int(revision), Arg::Int(revision)],
            )
            .await?;
        Ok(result.rows_affected())
    }

    /// Write a deleted filler row at exactly `id`.
    pub async fn fill(&self, id: i64) -> StrataResult<()> {
        let name = format!("{GAP_KEY_PREFIX}{id}");
        self.execute(&self.statements.fill, &[Arg::Int(id), Arg::Text(&name)])
            .await?;
        Ok(())
    }

    /// On-disk size of the revision table in bytes.
    pub async fn size(&self) -> StrataResult<i64> {
        Ok(self.fetch_i64(&self.statements.size, &[]).await?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let config = StorageConfig {
            write_retry_attempts: 0,
            write_retry_backoff_ms: 25,
            ..StorageConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.step, Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_coordinator_serializes_only_when_asked() {
        let serialized = WriteCoordinator::new(true);
        assert!(serialized.is_serialized());
        let guard = serialized.acquire().await;
        assert!(guard.is_some());

        let free = WriteCoordinator::new(false);
        assert!(free.acquire().await.is_none());
    }
}
