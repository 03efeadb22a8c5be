//! Shared poller feeding the watch hub.
//!
//! A single task owns the read cursor. It wakes on every local write, on a
//! fixed tick (to see writes from other processes), or on cancellation, and
//! publishes every record after the cursor in revision order.
//!
//! Revisions can become visible out of order when concurrent transactions
//! commit. When the poller sees a hole it stops just before it and looks
//! again shortly. A hole that persists for `gap_skip_after` belongs to a
//! transaction that rolled back; it is plugged with a deleted filler row so
//! the cursor can move on.

use super::hub::WatchHub;
use crate::core::config::WatchConfig;
use crate::core::error::StrataResult;
use crate::mvcc::Record;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const GAP_RETRY_DELAY: Duration = Duration::from_millis(25);

/// What the poller should do with a scanned batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Every record is contiguous with the cursor.
    Complete,
    /// A recent hole; stop before it and look again soon.
    Stalled,
    /// A hole old enough to plug with filler rows.
    Fill(Range<i64>),
}

/// Tracks how long a revision hole has been open.
#[derive(Debug)]
pub(crate) struct GapTracker {
    skip_after: Duration,
    pending: Option<(i64, Instant)>,
}

impl GapTracker {
    pub(crate) fn new(skip_after: Duration) -> Self {
        Self {
            skip_after,
            pending: None,
        }
    }

    /// Count the records contiguous with `cursor` and decide what to do
    /// about the first hole, if any.
    pub(crate) fn scan(&mut self, cursor: i64, records: &[Record], now: Instant) -> (usize, Scan) {
        let mut last = cursor;
        for (index, record) in records.iter().enumerate() {
            if record.id <= last + 1 {
                last = last.max(record.id);
                continue;
            }

            let missing = last + 1..record.id;
            return match self.pending {
                Some((start, since)) if start == missing.start => {
                    if now.duration_since(since) >= self.skip_after {
                        self.pending = None;
                        (index, Scan::Fill(missing))
                    } else {
                        (index, Scan::Stalled)
                    }
                }
                _ => {
                    tracing::debug!(
                        from = missing.start,
                        to = missing.end - 1,
                        "revision gap detected"
                    );
                    self.pending = Some((missing.start, now));
                    (index, Scan::Stalled)
                }
            };
        }
        self.pending = None;
        (records.len(), Scan::Complete)
    }
}

/// The shared poller task.
#[derive(Debug)]
pub struct Poller {
    hub: WatchHub,
    written: Arc<Notify>,
    interval: Duration,
    batch_size: i64,
    gaps: GapTracker,
    cursor: i64,
}

impl Poller {
    /// Create a poller resuming from the hub's cursor.
    pub fn new(hub: WatchHub, config: &WatchConfig) -> Self {
        Self {
            written: hub.backend().write_signal(),
            cursor: hub.cursor(),
            hub,
            interval: config.poll_interval(),
            batch_size: config.poll_batch_size.max(1),
            gaps: GapTracker::new(config.gap_skip_after()),
        }
    }

    /// Poll until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stalled = false;

        tracing::debug!(cursor = self.cursor, "poller started");
        loop {
            if stalled {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(GAP_RETRY_DELAY.min(self.interval)) => {}
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.written.notified() => {}
                    _ = ticker.tick() => {}
                }
            }

            stalled = match self.poll().await {
                Ok(stalled) => stalled,
                Err(err) => {
                    tracing::warn!(error = %err, cursor = self.cursor, "poll failed");
                    false
                }
            };
        }
        tracing::debug!(cursor = self.cursor, "poller stopped");
    }

    /// Read and publish everything after the cursor. Returns true when a
    /// revision hole stopped progress.
    pub async fn poll(&mut self) -> StrataResult<bool> {
        loop {
            let records = self
                .hub
                .backend()
                .driver()
                .list_since("", self.cursor, self.batch_size)
                .await?;
            let full = records.len() as i64 >= self.batch_size;

            let mut rest = records.as_slice();
            loop {
                let (count, scan) = self.gaps.scan(self.cursor, rest, Instant::now());
                let (ready, tail) = rest.split_at(count);
                self.publish(ready);

                match scan {
                    Scan::Complete => break,
                    Scan::Stalled => return Ok(true),
                    Scan::Fill(missing) => {
                        if !self.fill(missing.clone()).await {
                            return Ok(true);
                        }
                        self.cursor = missing.end - 1;
                        rest = tail;
                    }
                }
            }

            if !full {
                return Ok(false);
            }
        }
    }

    fn publish(&mut self, records: &[Record]) {
        let Some(last) = records.last() else {
            return;
        };
        let cursor = last.id.max(self.cursor);
        self.hub.publish(records, cursor);
        self.cursor = cursor;
    }

    /// Plug a hole with filler rows. Returns false if a real record showed
    /// up in the meantime or the write failed.
    async fn fill(&self, missing: Range<i64>) -> bool {
        let driver = self.hub.backend().driver();
        for id in missing {
            match driver.fill(id).await {
                Ok(()) => tracing::info!(revision = id, "filled revision gap"),
                Err(err) if err.is_unique_violation() => {
                    tracing::debug!(revision = id, "gap closed before fill");
                    return false;
                }
                Err(err) => {
                    tracing::warn!(revision = id, error = %err, "failed to fill revision gap");
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> Record {
        Record {
            id,
            name: format!("/k{id}"),
            ..Record::default()
        }
    }

    #[test]
    fn test_contiguous_batch_completes() {
        let mut gaps = GapTracker::new(Duration::from_secs(1));
        let records = [record(11), record(12), record(13)];
        assert_eq!(
            gaps.scan(10, &records, Instant::now()),
            (3, Scan::Complete)
        );
    }

    #[test]
    fn test_new_gap_stalls() {
        let mut gaps = GapTracker::new(Duration::from_secs(1));
        let records = [record(11), record(13)];
        let now = Instant::now();
        assert_eq!(gaps.scan(10, &records, now), (1, Scan::Stalled));
        // Still inside the grace period.
        assert_eq!(
            gaps.scan(11, &records[1..], now + Duration::from_millis(500)),
            (0, Scan::Stalled)
        );
    }

    #[test]
    fn test_old_gap_is_filled() {
        let mut gaps = GapTracker::new(Duration::from_secs(1));
        let records = [record(14)];
        let now = Instant::now();
        assert_eq!(gaps.scan(11, &records, now), (0, Scan::Stalled));
        assert_eq!(
            gaps.scan(11, &records, now + Duration::from_secs(2)),
            (0, Scan::Fill(12..14))
        );
    }

    #[test]
    fn test_gap_closing_clears_pending() {
        let mut gaps = GapTracker::new(Duration::from_secs(1));
        let now = Instant::now();
        assert_eq!(gaps.scan(10, &[record(12)], now), (0, Scan::Stalled));
        assert_eq!(
            gaps.scan(10, &[record(11), record(12)], now),
            (2, Scan::Complete)
        );
        assert!(gaps.pending.is_none());
    }
}
