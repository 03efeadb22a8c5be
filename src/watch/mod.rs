//! Watch multiplexer.
//!
//! - [`filter`] - Key selection and event filters
//! - [`hub`] - Watch registry and fan-out
//! - [`poller`] - Shared poller with revision gap handling

pub mod filter;
pub mod hub;
pub mod poller;

pub use filter::{prefix_end, EventFilters, KeyFilter};
pub use hub::{Watch, WatchBatch, WatchHub};
pub use poller::Poller;

use crate::core::config::WatchConfig;
use crate::core::error::StrataResult;
use crate::mvcc::Backend;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Create a hub positioned at the current revision and spawn its poller.
pub async fn start(
    backend: Backend,
    config: &WatchConfig,
    cancel: CancellationToken,
) -> StrataResult<(WatchHub, JoinHandle<()>)> {
    let cursor = backend.current_revision().await?;
    let hub = WatchHub::new(backend, config, cursor);
    let poller = Poller::new(hub.clone(), config);
    let handle = tokio::spawn(poller.run(cancel));
    Ok((hub, handle))
}
