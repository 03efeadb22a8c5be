//! Compaction revision tracking and background compaction.
//!
//! The compaction revision lives in the `compact_rev_key` sentinel row.
//! It only ever moves forward. The background [`Compactor`] walks it toward
//! the revision seen on its previous tick, one batch at a time, never
//! touching the newest `min_retain` revisions.

use super::driver::Driver;
use crate::core::config::CompactionConfig;
use crate::core::error::{StrataError, StrataResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Compaction policy.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    /// Newest revisions never compacted.
    pub min_retain: i64,
    /// Revisions advanced per batch.
    pub batch_size: i64,
    /// Time allowed for one batch.
    pub timeout: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_retain: 1_000,
            batch_size: 1_000,
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&CompactionConfig> for CompactionPolicy {
    fn from(config: &CompactionConfig) -> Self {
        Self {
            min_retain: config.min_retain,
            batch_size: config.batch_size.max(1),
            timeout: config.timeout(),
        }
    }
}

impl CompactionPolicy {
    /// Clamp a target so the newest `min_retain` revisions are kept.
    pub fn safe_target(&self, target: i64, current_revision: i64) -> i64 {
        target.min(current_revision - self.min_retain).max(0)
    }

    /// End revision of the batch starting at `from`.
    pub fn batch_end(&self, from: i64, target: i64) -> i64 {
        (from + self.batch_size).min(target)
    }
}

/// Reads and advances the compaction revision.
#[derive(Debug, Clone)]
pub struct RevisionTracker {
    driver: Driver,
}

impl RevisionTracker {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    /// Current global revision.
    pub async fn current_revision(&self) -> StrataResult<i64> {
        self.driver.current_revision().await
    }

    /// Stored compaction revision.
    pub async fn compact_revision(&self) -> StrataResult<i64> {
        self.driver.compact_revision().await
    }

    /// Advance the compaction revision; lower values are ignored.
    pub async fn set_compact_revision(&self, revision: i64) -> StrataResult<()> {
        self.driver.set_compact_revision(revision).await
    }

    /// Make sure exactly one sentinel row exists.
    ///
    /// A fresh store gets one (this consumes a revision). When several
    /// exist, the one holding the highest compaction revision is kept.
    pub async fn ensure_sentinel(&self) -> StrataResult<i64> {
        let rows = self.driver.sentinel_rows().await?;
        let Some(&(_, keep_revision)) = rows.first() else {
            self.driver.insert_sentinel(0).await?;
            tracing::debug!("created compaction sentinel");
            return Ok(0);
        };
        for &(id, revision) in rows.iter().skip(1) {
            tracing::info!(id, revision, "removing duplicate compaction sentinel");
            self.driver.delete_revision(id).await?;
        }
        Ok(keep_revision)
    }

    /// Compact everything below `target` in batches.
    ///
    /// Returns the revision reached. Stops early if another writer moved
    /// the compaction revision while this pass was running.
    pub async fn compact(&self, target: i64, policy: &CompactionPolicy) -> StrataResult<i64> {
        let mut compact_rev = self.compact_revision().await?;
        let current = self.current_revision().await?;
        let target = policy.safe_target(target, current);
        if target <= compact_rev {
            tracing::trace!(compact_rev, target, "nothing to compact");
            return Ok(compact_rev);
        }

        let start = compact_rev;
        let mut deleted = 0u64;
        while compact_rev < target {
            let batch_rev = policy.batch_end(compact_rev, target);
            let rows = tokio::time::timeout(policy.timeout, self.driver.compact(batch_rev))
                .await
                .map_err(|_| {
                    StrataError::internal(format!("compaction to {batch_rev} timed out"))
                })??;

            // Another process may be compacting the same table.
            let stored = self.compact_revision().await?;
            if stored != compact_rev {
                tracing::info!(
                    expected = compact_rev,
                    stored,
                    "compaction revision moved underneath us, abandoning pass"
                );
                return Ok(stored);
            }

            self.set_compact_revision(batch_rev).await?;
            deleted += rows;
            compact_rev = batch_rev;
        }

        tracing::info!(from = start, to = compact_rev, deleted, "compacted");
        Ok(compact_rev)
    }
}

/// Periodic background compaction.
#[derive(Debug)]
pub struct Compactor {
    tracker: RevisionTracker,
    policy: CompactionPolicy,
    interval: Duration,
}

impl Compactor {
    pub fn new(driver: Driver, config: &CompactionConfig) -> Self {
        Self {
            tracker: RevisionTracker::new(driver),
            policy: CompactionPolicy::from(config),
            interval: config.interval(),
        }
    }

    /// Run until cancelled. Each tick compacts toward the revision observed
    /// on the previous tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut target = 0i64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("compactor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if target > 0 {
                if let Err(err) = self.tracker.compact(target, &self.policy).await {
                    tracing::warn!(error = %err, target, "compaction failed");
                }
            }

            match self.tracker.current_revision().await {
                Ok(current) => target = current,
                Err(err) => tracing::warn!(error = %err, "failed to read current revision"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_target_keeps_recent_revisions() {
        let policy = CompactionPolicy::default();
        assert_eq!(policy.safe_target(5_000, 5_500), 4_500);
        assert_eq!(policy.safe_target(100, 5_500), 100);
        assert_eq!(policy.safe_target(500, 800), 0);
    }

    #[test]
    fn test_batch_end() {
        let policy = CompactionPolicy {
            batch_size: 10,
            ..CompactionPolicy::default()
        };
        assert_eq!(policy.batch_end(0, 25), 10);
        assert_eq!(policy.batch_end(20, 25), 25);
    }
}
