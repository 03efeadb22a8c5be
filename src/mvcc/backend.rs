//! Key-value transaction engine.
//!
//! Create, Update and Delete append a record whose `prev_revision` names
//! the record it replaces. The unique `(name, prev_revision)` index lets
//! exactly one of two racing writers against the same predecessor win; the
//! loser sees a unique violation, which is reported as a failed compare.

use super::record::{Record, WriteOutcome};
use crate::core::config::StorageConfig;
use crate::core::error::{StrataError, StrataResult};
use crate::storage::compaction::RevisionTracker;
use crate::storage::driver::{Driver, NewRecord, RetryPolicy};
use crate::storage::endpoint;
use std::sync::Arc;
use tokio::sync::Notify;

/// The revisioned key-value store.
#[derive(Debug, Clone)]
pub struct Backend {
    driver: Driver,
    tracker: RevisionTracker,
    written: Arc<Notify>,
}

impl Backend {
    /// Wrap an existing driver.
    pub fn new(driver: Driver) -> Self {
        Self {
            tracker: RevisionTracker::new(driver.clone()),
            driver,
            written: Arc::new(Notify::new()),
        }
    }

    /// Connect to the configured datastore and prepare it for use.
    pub async fn open(config: &StorageConfig) -> anyhow::Result<Self> {
        let (pool, dialect) = endpoint::connect(config).await?;
        let backend = Self::new(Driver::new(pool, dialect, RetryPolicy::from(config)));
        backend.start().await?;
        Ok(backend)
    }

    /// Create the schema and the compaction sentinel if absent.
    pub async fn start(&self) -> StrataResult<()> {
        self.driver.setup_schema().await?;
        let compact_rev = self.tracker.ensure_sentinel().await?;
        let current = self.driver.current_revision().await?;
        tracing::info!(
            dialect = self.driver.dialect().name(),
            current_revision = current,
            compact_revision = compact_rev,
            "backend started"
        );
        Ok(())
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Compaction revision tracker.
    pub fn tracker(&self) -> &RevisionTracker {
        &self.tracker
    }

    /// Signalled after every successful write.
    pub fn write_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.written)
    }

    fn notify_write(&self) {
        self.written.notify_one();
    }

    /// Current global revision.
    pub async fn current_revision(&self) -> StrataResult<i64> {
        self.driver.current_revision().await
    }

    /// Stored compaction revision.
    pub async fn compact_revision(&self) -> StrataResult<i64> {
        self.driver.compact_revision().await
    }

    /// Fail if `revision` is compacted or not yet written.
    async fn check_revision(&self, revision: i64) -> StrataResult<()> {
        let compact_revision = self.driver.compact_revision().await?;
        if revision < compact_revision {
            return Err(StrataError::RevisionCompacted {
                revision,
                compact_revision,
            });
        }
        let current_revision = self.driver.current_revision().await?;
        if revision > current_revision {
            return Err(StrataError::FutureRevision {
                revision,
                current_revision,
            });
        }
        Ok(())
    }

    /// Latest live record for `key`, optionally as of `revision` (0 = now).
    pub async fn get(&self, key: &str, revision: i64) -> StrataResult<(i64, Option<Record>)> {
        let pinned = if revision > 0 {
            self.check_revision(revision).await?;
            Some(revision)
        } else {
            None
        };
        let record = self
            .driver
            .latest(key, pinned)
            .await?
            .filter(|r| !r.deleted && r.is_visible());
        let current = self.driver.current_revision().await?;
        Ok((current, record))
    }

    /// Newest record of `key` including tombstones.
    async fn latest(&self, key: &str) -> StrataResult<Option<Record>> {
        self.driver.latest(key, None).await
    }

    /// Create `key`; fails with [`StrataError::KeyExists`] if it is live.
    pub async fn create(&self, key: &str, value: &[u8], lease: i64) -> StrataResult<i64> {
        let prev_revision = match self.latest(key).await? {
            Some(record) if !record.deleted => return Err(StrataError::KeyExists),
            Some(tombstone) => tombstone.id,
            None => 0,
        };

        let result = self
            .driver
            .insert(NewRecord {
                name: key,
                created: true,
                deleted: false,
                create_revision: 0,
                prev_revision,
                lease,
                value: Some(value),
                old_value: None,
            })
            .await;

        match result {
            Ok(revision) => {
                tracing::trace!(key, revision, "create");
                self.notify_write();
                Ok(revision)
            }
            Err(err) if err.is_unique_violation() => Err(StrataError::KeyExists),
            Err(err) => Err(err),
        }
    }

    /// Replace `key` if its current revision is `expected`. An `expected`
    /// of 0 creates the key instead.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected: i64,
        lease: i64,
    ) -> StrataResult<WriteOutcome> {
        if expected == 0 {
            return match self.create(key, value, lease).await {
                Ok(revision) => Ok(WriteOutcome {
                    revision,
                    record: None,
                    matched: true,
                }),
                Err(StrataError::KeyExists) => self.mismatch(key).await,
                Err(err) => Err(err),
            };
        }

        let current = match self.latest(key).await? {
            Some(record) if !record.deleted && record.id == expected => record,
            _ => return self.mismatch(key).await,
        };

        let result = self
            .driver
            .insert(NewRecord {
                name: key,
                created: false,
                deleted: false,
                create_revision: current.create_revision,
                prev_revision: current.id,
                lease,
                value: Some(value),
                old_value: current.value.as_deref(),
            })
            .await;

        match result {
            Ok(revision) => {
                tracing::trace!(key, revision, expected, "update");
                self.notify_write();
                Ok(WriteOutcome {
                    revision,
                    record: Some(current),
                    matched: true,
                })
            }
            Err(err) if err.is_unique_violation() => self.mismatch(key).await,
            Err(err) => Err(err),
        }
    }

    /// Delete `key` if its current revision is `expected`; 0 deletes
    /// unconditionally.
    pub async fn delete(&self, key: &str, expected: i64) -> StrataResult<WriteOutcome> {
        let current = match self.latest(key).await? {
            Some(record) if !record.deleted => record,
            _ => return self.mismatch(key).await,
        };
        if expected != 0 && current.id != expected {
            return self.mismatch(key).await;
        }

        let result = self
            .driver
            .insert(NewRecord {
                name: key,
                created: false,
                deleted: true,
                create_revision: current.create_revision,
                prev_revision: current.id,
                lease: current.lease,
                value: None,
                old_value: current.value.as_deref(),
            })
            .await;

        match result {
            Ok(revision) => {
                tracing::trace!(key, revision, expected, "delete");
                self.notify_write();
                Ok(WriteOutcome {
                    revision,
                    record: Some(current),
                    matched: true,
                })
            }
            Err(err) if err.is_unique_violation() => self.mismatch(key).await,
            Err(err) => Err(err),
        }
    }

    /// A failed compare: the current revision and the key's live record.
    async fn mismatch(&self, key: &str) -> StrataResult<WriteOutcome> {
        let (revision, record) = self.get(key, 0).await?;
        Ok(WriteOutcome {
            revision,
            record,
            matched: false,
        })
    }

    /// Newest record of every key under `prefix`, ordered by key.
    ///
    /// `start_key` resumes strictly after that key. `revision == 0` reads
    /// the current state; otherwise the state as of `revision`.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> StrataResult<(i64, Vec<Record>)> {
        let start = (!start_key.is_empty()).then_some(start_key);
        let records = if revision > 0 {
            self.check_revision(revision).await?;
            self.driver
                .list_after(prefix, start, revision, limit, include_deleted)
                .await?
        } else {
            self.driver
                .list_current(prefix, start, limit, include_deleted)
                .await?
        };
        let records = records.into_iter().filter(Record::is_visible).collect();
        let current = self.driver.current_revision().await?;
        Ok((current, records))
    }

    /// Current revision and the number of live keys under `prefix`.
    pub async fn count(&self, prefix: &str, revision: i64) -> StrataResult<(i64, i64)> {
        if revision > 0 {
            self.check_revision(revision).await?;
            self.driver.count(prefix, Some(revision)).await
        } else {
            self.driver.count(prefix, None).await
        }
    }

    /// Every change under `prefix` after `since`, ascending by revision.
    ///
    /// Fails with [`StrataError::RevisionCompacted`] when part of the
    /// requested history may already be gone.
    pub async fn after(
        &self,
        prefix: &str,
        since: i64,
        limit: i64,
    ) -> StrataResult<(i64, Vec<Record>)> {
        let compact_revision = self.driver.compact_revision().await?;
        if since + 1 < compact_revision {
            return Err(StrataError::RevisionCompacted {
                revision: since + 1,
                compact_revision,
            });
        }
        let records = self
            .driver
            .list_since(prefix, since, limit)
            .await?
            .into_iter()
            .filter(Record::is_visible)
            .collect();
        let current = self.driver.current_revision().await?;
        Ok((current, records))
    }

    /// On-disk size of the store in bytes.
    pub async fn db_size(&self) -> StrataResult<i64> {
        self.driver.size().await
    }
}
