//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::time::Duration;
use strata::adapters::etcd::SharedState;
use strata::core::config::{ListenerConfig, StorageConfig, WatchConfig};
use strata::mvcc::Backend;
use strata::watch::WatchHub;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How long a test waits for an asynchronous delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage configuration for a SQLite database inside `dir`.
pub fn sqlite_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        endpoint: format!("sqlite://{}", dir.path().join("strata.db").display()),
        startup_attempts: 1,
        ..StorageConfig::default()
    }
}

/// Open a fresh backend. Revision 1 is taken by the compaction sentinel.
pub async fn open_backend(dir: &TempDir) -> Backend {
    Backend::open(&sqlite_config(dir))
        .await
        .expect("failed to open backend")
}

/// Watch configuration with a short poll interval.
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        poll_interval_ms: 20,
        gap_skip_after_ms: 100,
        ..WatchConfig::default()
    }
}

/// A running watch hub and the token that stops its poller.
pub struct Watching {
    pub hub: WatchHub,
    pub cancel: CancellationToken,
}

impl Drop for Watching {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start the watch poller over `backend`.
pub async fn start_watching(backend: &Backend) -> Watching {
    let cancel = CancellationToken::new();
    let (hub, _handle) = strata::watch::start(backend.clone(), &fast_watch_config(), cancel.clone())
        .await
        .expect("failed to start watch poller");
    Watching { hub, cancel }
}

/// Bridge state over `backend` and `hub`, plus the shutdown sender.
pub fn shared_state(backend: &Backend, hub: &WatchHub) -> (SharedState, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = SharedState::new(
        backend.clone(),
        hub.clone(),
        &ListenerConfig::default(),
        "http://127.0.0.1:2379".to_string(),
        shutdown_rx,
    );
    (state, shutdown_tx)
}

/// Write `content` to a temporary config file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}
