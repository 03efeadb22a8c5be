//! Watch multiplexer.
//!
//! Watches are registered in a shared registry. The poller task hands every
//! new batch of records to [`WatchHub::publish`], which fans it out to the
//! bounded live queue of each interested watch and advances the published
//! cursor in the same critical section.
//!
//! Each watch gets a forwarding task. It replays history from the watch's
//! start revision up to the cursor observed at registration, then forwards
//! live batches above that cursor. A watch whose live queue is full is
//! dropped from the registry and its stream ends with
//! [`StrataError::WatchLagged`].

use super::filter::KeyFilter;
use crate::core::config::WatchConfig;
use crate::core::error::{StrataError, StrataResult};
use crate::mvcc::{Backend, Record};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One delivery to a watch: records in ascending revision order, or the
/// error that ended the watch.
pub type WatchBatch = StrataResult<Vec<Record>>;

struct Registration {
    filter: KeyFilter,
    live: mpsc::Sender<Vec<Record>>,
}

struct Registry {
    watches: HashMap<i64, Registration>,
    /// Highest revision handed to the registry.
    cursor: i64,
}

struct HubInner {
    backend: Backend,
    registry: Mutex<Registry>,
    next_id: AtomicI64,
    queue_depth: usize,
    page_size: i64,
}

/// Registry of active watches, shared by the bridge and the poller.
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub")
            .field("watches", &self.len())
            .field("cursor", &self.cursor())
            .finish()
    }
}

impl WatchHub {
    /// Create a hub whose cursor starts at `cursor`.
    pub fn new(backend: Backend, config: &WatchConfig, cursor: i64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend,
                registry: Mutex::new(Registry {
                    watches: HashMap::new(),
                    cursor,
                }),
                next_id: AtomicI64::new(1),
                queue_depth: config.queue_depth.max(1),
                page_size: config.poll_batch_size.max(1),
            }),
        }
    }

    /// The backend this hub reads history from.
    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    /// Number of registered watches.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().watches.len()
    }

    /// Whether no watches are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest revision published to watches.
    pub fn cursor(&self) -> i64 {
        self.inner.registry.lock().cursor
    }

    /// Register a watch.
    ///
    /// `start_revision == 0` delivers only changes after the current
    /// revision. A start below the compaction revision fails with
    /// [`StrataError::RevisionCompacted`].
    pub async fn register(&self, filter: KeyFilter, start_revision: i64) -> StrataResult<Watch> {
        let backend = &self.inner.backend;
        let current = backend.current_revision().await?;
        let start = if start_revision > 0 {
            let compact_revision = backend.compact_revision().await?;
            if start_revision < compact_revision {
                return Err(StrataError::RevisionCompacted {
                    revision: start_revision,
                    compact_revision,
                });
            }
            start_revision
        } else {
            current + 1
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (live_tx, live_rx) = mpsc::channel(self.inner.queue_depth);
        let (out_tx, out_rx) = mpsc::channel(self.inner.queue_depth);
        let cancel = CancellationToken::new();

        let cursor = {
            let mut registry = self.inner.registry.lock();
            registry.watches.insert(
                id,
                Registration {
                    filter: filter.clone(),
                    live: live_tx,
                },
            );
            registry.cursor
        };

        tracing::debug!(watch_id = id, start, cursor, "watch registered");

        let forward = Forward {
            id,
            backend: backend.clone(),
            filter,
            start,
            cursor,
            page_size: self.inner.page_size,
            out: out_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(forward.run(live_rx));

        Ok(Watch {
            id,
            revision: current,
            events: out_rx,
            cancel,
            hub: self.clone(),
        })
    }

    /// Remove a watch from the registry.
    pub(crate) fn remove(&self, watch_id: i64) -> bool {
        let removed = self.inner.registry.lock().watches.remove(&watch_id).is_some();
        if removed {
            tracing::debug!(watch_id, "watch cancelled");
        }
        removed
    }

    /// Fan `records` out to every interested watch and advance the cursor
    /// to `cursor`.
    ///
    /// Never blocks: a watch whose queue is full is dropped, and one whose
    /// forwarding task is gone is removed.
    pub(crate) fn publish(&self, records: &[Record], cursor: i64) {
        let mut registry = self.inner.registry.lock();
        let mut dropped = Vec::new();

        for (&id, registration) in registry.watches.iter() {
            let batch: Vec<Record> = records
                .iter()
                .filter(|r| r.is_visible() && registration.filter.matches(&r.name))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }
            match registration.live.try_send(batch) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(watch_id = id, "watch lagged behind the event feed, dropping");
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        for id in dropped {
            registry.watches.remove(&id);
        }
        if cursor > registry.cursor {
            registry.cursor = cursor;
        }
    }
}

/// Per-watch forwarding task.
struct Forward {
    id: i64,
    backend: Backend,
    filter: KeyFilter,
    start: i64,
    cursor: i64,
    page_size: i64,
    out: mpsc::Sender<WatchBatch>,
    cancel: CancellationToken,
}

impl Forward {
    async fn run(self, mut live: mpsc::Receiver<Vec<Record>>) {
        let last = match self.catch_up().await {
            Ok(last) => last,
            Err(err) => {
                let _ = self.out.send(Err(err)).await;
                return;
            }
        };

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                batch = live.recv() => batch,
            };
            let Some(batch) = batch else {
                // The registry dropped us without a cancel: overflow.
                let _ = self
                    .out
                    .send(Err(StrataError::WatchLagged { watch_id: self.id }))
                    .await;
                return;
            };

            let batch: Vec<Record> = batch.into_iter().filter(|r| r.id > last).collect();
            if batch.is_empty() {
                continue;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                sent = self.out.send(Ok(batch)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Replay `[start, cursor]`; returns the revision live delivery
    /// resumes after.
    async fn catch_up(&self) -> StrataResult<i64> {
        let floor = self.start - 1;
        if floor >= self.cursor {
            return Ok(floor);
        }

        let prefix = self.filter.sql_prefix();
        let mut last = floor;
        while last < self.cursor {
            let rows = self
                .backend
                .driver()
                .list_since(&prefix, last, self.page_size)
                .await?;
            let exhausted = (rows.len() as i64) < self.page_size;
            let reached = rows.last().map_or(true, |r| r.id >= self.cursor);
            let batch: Vec<Record> = rows
                .into_iter()
                .take_while(|r| r.id <= self.cursor)
                .inspect(|r| last = r.id)
                .filter(|r| r.is_visible() && self.filter.matches(&r.name))
                .collect();

            if !batch.is_empty() && self.out.send(Ok(batch)).await.is_err() {
                break;
            }
            if exhausted || reached || self.cancel.is_cancelled() {
                break;
            }
        }
        Ok(self.cursor.max(floor))
    }
}

/// A registered watch.
///
/// Dropping it cancels the watch.
pub struct Watch {
    id: i64,
    revision: i64,
    events: mpsc::Receiver<WatchBatch>,
    cancel: CancellationToken,
    hub: WatchHub,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .finish()
    }
}

impl Watch {
    /// Watch id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Current revision at registration.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Next batch, or `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<WatchBatch> {
        self.events.recv().await
    }

    /// Token cancelled when this watch is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the watch.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.hub.remove(self.id);
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StorageConfig;

    async fn backend(dir: &tempfile::TempDir) -> Backend {
        let config = StorageConfig {
            endpoint: format!("sqlite://{}", dir.path().join("hub.db").display()),
            startup_attempts: 1,
            ..StorageConfig::default()
        };
        Backend::open(&config).await.unwrap()
    }

    fn record(id: i64, name: &str) -> Record {
        Record {
            id,
            name: name.to_string(),
            created: true,
            create_revision: id,
            value: Some(b"v".to_vec()),
            ..Record::default()
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_filter() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let cursor = backend.current_revision().await.unwrap();
        let hub = WatchHub::new(backend, &WatchConfig::default(), cursor);

        let mut pods = hub.register(KeyFilter::prefix("/pods/"), 0).await.unwrap();
        let _nodes = hub.register(KeyFilter::prefix("/nodes/"), 0).await.unwrap();
        assert_eq!(hub.len(), 2);

        hub.publish(
            &[record(cursor + 1, "/nodes/a"), record(cursor + 2, "/pods/a")],
            cursor + 2,
        );
        assert_eq!(hub.cursor(), cursor + 2);

        let batch = pods.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "/pods/a");
    }

    #[tokio::test]
    async fn test_full_queue_drops_watch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let cursor = backend.current_revision().await.unwrap();
        let config = WatchConfig {
            queue_depth: 1,
            ..WatchConfig::default()
        };
        let hub = WatchHub::new(backend, &config, cursor);
        let mut watch = hub.register(KeyFilter::prefix("/a/"), 0).await.unwrap();

        for offset in 1..=4 {
            let id = cursor + offset;
            hub.publish(&[record(id, "/a/x")], id);
        }
        assert!(hub.is_empty());

        let mut lagged = false;
        while let Some(batch) = watch.next().await {
            if let Err(StrataError::WatchLagged { watch_id }) = batch {
                assert_eq!(watch_id, watch.id());
                lagged = true;
            }
        }
        assert!(lagged);
    }

    #[tokio::test]
    async fn test_cancel_removes_registration() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let hub = WatchHub::new(backend, &WatchConfig::default(), 0);

        let watch = hub.register(KeyFilter::exact("/a"), 0).await.unwrap();
        assert_eq!(hub.len(), 1);
        drop(watch);
        assert!(hub.is_empty());
    }
}
