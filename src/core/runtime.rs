//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage → watch poller → compactor → listener
//! - Shutdown order: listener → compactor → watch poller → storage

use crate::adapters::etcd::{EtcdGrpcServer, SharedState};
use crate::core::config::Config;
use crate::core::error::StrataResult;
use crate::mvcc::Backend;
use crate::net::{BoundListener, ListenAddress, TlsIdentity};
use crate::storage::Compactor;
use crate::watch::{self, WatchHub};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long stop waits for each background task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is switched off by configuration.
    Disabled,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Storage backend health.
    pub storage: ComponentHealth,
    /// Watch poller health.
    pub watch: ComponentHealth,
    /// Background compactor health.
    pub compactor: ComponentHealth,
    /// gRPC listener health.
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            watch: ComponentHealth::Starting,
            compactor: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.storage, self.watch, self.compactor, self.listener),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Disabled,
                ComponentHealth::Healthy
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        ![self.storage, self.watch, self.listener].contains(&ComponentHealth::Failed)
    }
}

/// Requests shutdown of a runtime from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<signal::Sender<bool>>,
}

impl ShutdownHandle {
    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Strata runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Storage backend (if initialized).
    backend: Option<Backend>,

    /// Watch registry (if initialized).
    hub: Option<WatchHub>,

    /// Address the listener actually bound.
    local_addr: Option<SocketAddr>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: Arc<signal::Sender<bool>>,

    /// Shutdown signal receiver.
    shutdown_rx: signal::Receiver<bool>,

    /// Cancels the poller and the compactor.
    tasks: CancellationToken,

    poller_handle: Option<JoinHandle<()>>,
    compactor_handle: Option<JoinHandle<()>>,
    grpc_handle: Option<JoinHandle<StrataResult<()>>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = signal::channel(false);

        Ok(Self {
            config: Arc::new(config),
            backend: None,
            hub: None,
            local_addr: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            tasks: CancellationToken::new(),
            poller_handle: None,
            compactor_handle: None,
            grpc_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the storage backend (if initialized).
    pub fn backend(&self) -> Option<&Backend> {
        self.backend.as_ref()
    }

    /// Get the watch registry (if initialized).
    pub fn hub(&self) -> Option<&WatchHub> {
        self.hub.as_ref()
    }

    /// TCP address of the gRPC listener once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> signal::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Handle that can trigger shutdown while [`Runtime::run`] is waiting.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            listen = %self.config.listener.address,
            "starting strata runtime"
        );

        self.init_storage().await?;
        self.init_watch().await?;
        self.init_compactor();
        self.start_listener().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("strata runtime started");
        Ok(())
    }

    async fn init_storage(&mut self) -> Result<()> {
        tracing::debug!("initializing storage backend");
        match Backend::open(&self.config.storage).await {
            Ok(backend) => {
                self.backend = Some(backend);
                self.health.storage = ComponentHealth::Healthy;
                Ok(())
            }
            Err(err) => {
                self.health.storage = ComponentHealth::Failed;
                Err(err.context("failed to open storage backend"))
            }
        }
    }

    async fn init_watch(&mut self) -> Result<()> {
        let backend = self
            .backend
            .clone()
            .context("storage backend not initialized")?;
        let (hub, handle) = watch::start(backend, &self.config.watch, self.tasks.child_token())
            .await
            .context("failed to start watch poller")?;

        tracing::info!(cursor = hub.cursor(), "watch poller started");
        self.hub = Some(hub);
        self.poller_handle = Some(handle);
        self.health.watch = ComponentHealth::Healthy;
        Ok(())
    }

    fn init_compactor(&mut self) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if !self.config.compaction.enabled {
            tracing::info!("background compaction disabled");
            self.health.compactor = ComponentHealth::Disabled;
            return;
        }

        let compactor = Compactor::new(backend.driver().clone(), &self.config.compaction);
        self.compactor_handle = Some(tokio::spawn(compactor.run(self.tasks.child_token())));
        self.health.compactor = ComponentHealth::Healthy;
        tracing::info!(
            interval_secs = self.config.compaction.interval_secs,
            "background compaction started"
        );
    }

    async fn start_listener(&mut self) -> Result<()> {
        let listener_config = &self.config.listener;
        let backend = self
            .backend
            .clone()
            .context("storage backend not initialized")?;
        let hub = self.hub.clone().context("watch hub not initialized")?;

        let address = ListenAddress::parse(&listener_config.address)?;
        let tls = match (&listener_config.tls_cert_path, &listener_config.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsIdentity::load(cert, key)?),
            _ => None,
        };
        if tls.is_none() {
            tracing::warn!(listen = %address, "serving gRPC without TLS");
        }

        let bound = match BoundListener::bind(&address).await {
            Ok(bound) => bound,
            Err(err) => {
                self.health.listener = ComponentHealth::Failed;
                return Err(err);
            }
        };
        self.local_addr = bound.local_addr();

        let client_url = bound.client_url(tls.is_some());
        let state = SharedState::new(
            backend,
            hub,
            listener_config,
            client_url.clone(),
            self.shutdown_rx.clone(),
        );
        let server = EtcdGrpcServer::new(bound, tls, state);
        self.grpc_handle = Some(tokio::spawn(server.run()));

        self.health.listener = ComponentHealth::Healthy;
        tracing::info!(listen = %address, client_url, "gRPC listener started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until SIGINT, a shutdown request, or a listener
    /// failure.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_requested = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match self.grpc_handle.take() {
            Some(handle) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::warn!("shutdown signal received (SIGINT)");
                    }
                    _ = shutdown_requested => {
                        tracing::info!("shutdown requested by component");
                    }
                    result = handle => {
                        self.health.listener = ComponentHealth::Failed;
                        match result {
                            Ok(Ok(())) => tracing::info!("gRPC server stopped normally"),
                            Ok(Err(e)) => tracing::error!(error = %e, "gRPC server failed"),
                            Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::warn!("shutdown signal received (SIGINT)");
                    }
                    _ = shutdown_requested => {
                        tracing::info!("shutdown requested by component");
                    }
                }
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping strata runtime");
        self.running.store(false, Ordering::Release);

        let _ = self.shutdown_tx.send(true);

        self.health.listener = ComponentHealth::Stopping;
        if let Some(handle) = self.grpc_handle.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("gRPC server stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "gRPC server stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "gRPC server task panicked"),
                Err(_) => tracing::warn!("gRPC server stop timed out"),
            }
        }
        self.health.listener = ComponentHealth::Stopped;

        self.tasks.cancel();
        if let Some(handle) = self.compactor_handle.take() {
            self.health.compactor = ComponentHealth::Stopping;
            join_task("compactor", handle).await;
            self.health.compactor = ComponentHealth::Stopped;
        }
        if let Some(handle) = self.poller_handle.take() {
            self.health.watch = ComponentHealth::Stopping;
            join_task("watch poller", handle).await;
        }
        self.hub = None;
        self.health.watch = ComponentHealth::Stopped;

        self.health.storage = ComponentHealth::Stopping;
        if let Some(backend) = self.backend.take() {
            backend.driver().pool().close().await;
        }
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("strata runtime stopped");
        Ok(())
    }
}

async fn join_task(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(STOP_TIMEOUT, handle).await {
        Ok(Ok(())) => tracing::debug!(task = name, "task stopped"),
        Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task panicked"),
        Err(_) => tracing::warn!(task = name, "task stop timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_core_components() {
        let mut health = RuntimeHealth::default();
        assert!(!health.is_ready());

        health.storage = ComponentHealth::Healthy;
        health.watch = ComponentHealth::Healthy;
        health.compactor = ComponentHealth::Disabled;
        health.listener = ComponentHealth::Healthy;
        assert!(health.is_ready());
    }

    #[test]
    fn test_failed_storage_is_not_alive() {
        let health = RuntimeHealth {
            storage: ComponentHealth::Failed,
            ..RuntimeHealth::default()
        };
        assert!(!health.is_alive());
        assert!(RuntimeHealth::default().is_alive());
    }
}
