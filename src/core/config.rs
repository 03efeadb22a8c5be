//! Configuration parsing and validation.
//!
//! Strata configuration is loaded from a TOML file with CLI overrides. Every
//! section is optional; an empty file yields an embedded SQLite store served
//! on `127.0.0.1:2379`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// gRPC listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Watch multiplexer tuning.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Background compaction.
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage endpoint: `sqlite://path`, `postgres://...`, `mysql://...`,
    /// or a bare path for embedded SQLite.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Maximum open connections (0 lets the dialect decide).
    #[serde(default)]
    pub max_open_conns: u32,

    /// Minimum idle connections kept in the pool.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,

    /// Maximum lifetime of a pooled connection in seconds (0 = unlimited).
    #[serde(default)]
    pub conn_max_lifetime_secs: u64,

    /// Attempts to open and ping the datastore before giving up.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Delay between startup attempts in milliseconds.
    #[serde(default = "default_startup_backoff_ms")]
    pub startup_backoff_ms: u64,

    /// Attempts for a write that fails with a retryable error.
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,

    /// Linear backoff step between write retries in milliseconds.
    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_open_conns: 0,
            max_idle_conns: default_max_idle_conns(),
            conn_max_lifetime_secs: 0,
            startup_attempts: default_startup_attempts(),
            startup_backoff_ms: default_startup_backoff_ms(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
        }
    }
}

impl StorageConfig {
    /// Delay between startup attempts.
    pub fn startup_backoff(&self) -> Duration {
        Duration::from_millis(self.startup_backoff_ms)
    }

    /// Linear backoff step between write retries.
    pub fn write_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.write_retry_backoff_ms)
    }

    /// Connection lifetime, if bounded.
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        (self.conn_max_lifetime_secs > 0).then(|| Duration::from_secs(self.conn_max_lifetime_secs))
    }
}

/// gRPC listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listen address: `host:port` or `unix:///path/to/socket`.
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// TLS certificate chain path.
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    /// TLS private key path.
    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Cluster ID reported in response headers.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: u64,

    /// Member ID reported in response headers and MemberList.
    #[serde(default = "default_member_id")]
    pub member_id: u64,

    /// Member name reported by MemberList.
    #[serde(default = "default_member_name")]
    pub member_name: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            tls_cert_path: None,
            tls_key_path: None,
            cluster_id: default_cluster_id(),
            member_id: default_member_id(),
            member_name: default_member_name(),
        }
    }
}

impl ListenerConfig {
    /// Whether TLS termination is configured.
    pub fn has_tls(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Watch multiplexer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Poll interval of the shared poller in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum records read per poll.
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: i64,

    /// Event batches buffered per watch before it is dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long a revision gap may persist before it is filled.
    #[serde(default = "default_gap_skip_after_ms")]
    pub gap_skip_after_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_batch_size: default_poll_batch_size(),
            queue_depth: default_queue_depth(),
            gap_skip_after_ms: default_gap_skip_after_ms(),
        }
    }
}

impl WatchConfig {
    /// Poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gap tolerance as a Duration.
    pub fn gap_skip_after(&self) -> Duration {
        Duration::from_millis(self.gap_skip_after_ms)
    }
}

/// Background compaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Run the background compactor.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between compaction passes.
    #[serde(default = "default_compact_interval_secs")]
    pub interval_secs: u64,

    /// Newest revisions never compacted.
    #[serde(default = "default_compact_min_retain")]
    pub min_retain: i64,

    /// Revisions compacted per batch.
    #[serde(default = "default_compact_batch_size")]
    pub batch_size: i64,

    /// Timeout of a single batch in seconds.
    #[serde(default = "default_compact_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_compact_interval_secs(),
            min_retain: default_compact_min_retain(),
            batch_size: default_compact_batch_size(),
            timeout_secs: default_compact_timeout_secs(),
        }
    }
}

impl CompactionConfig {
    /// Interval between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-batch timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_endpoint() -> String {
    "sqlite://strata.db".to_string()
}

fn default_max_idle_conns() -> u32 {
    2
}

fn default_startup_attempts() -> u32 {
    300
}

fn default_startup_backoff_ms() -> u64 {
    1_000
}

fn default_write_retry_attempts() -> u32 {
    20
}

fn default_write_retry_backoff_ms() -> u64 {
    10
}

fn default_listen_address() -> String {
    "127.0.0.1:2379".to_string()
}

fn default_cluster_id() -> u64 {
    1
}

fn default_member_id() -> u64 {
    1
}

fn default_member_name() -> String {
    "strata".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_batch_size() -> i64 {
    500
}

fn default_queue_depth() -> usize {
    1_024
}

fn default_gap_skip_after_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_compact_interval_secs() -> u64 {
    300
}

fn default_compact_min_retain() -> i64 {
    1_000
}

fn default_compact_batch_size() -> i64 {
    1_000
}

fn default_compact_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref endpoint) = overrides.endpoint {
            self.storage.endpoint = endpoint.clone();
        }
        if let Some(ref listen) = overrides.listen {
            self.listener.address = listen.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_storage()?;
        self.validate_listener()?;
        self.validate_watch()?;
        self.validate_compaction()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        if self.storage.endpoint.trim().is_empty() {
            anyhow::bail!("storage.endpoint must not be empty");
        }
        if self.storage.startup_attempts == 0 {
            anyhow::bail!("storage.startup_attempts must be > 0");
        }
        if self.storage.write_retry_attempts == 0 {
            anyhow::bail!("storage.write_retry_attempts must be > 0");
        }
        Ok(())
    }

    fn validate_listener(&self) -> Result<()> {
        if self.listener.address.trim().is_empty() {
            anyhow::bail!("listener.address must not be empty");
        }
        match (&self.listener.tls_cert_path, &self.listener.tls_key_path) {
            (Some(_), None) => {
                anyhow::bail!("listener.tls_key_path required when tls_cert_path is set")
            }
            (None, Some(_)) => {
                anyhow::bail!("listener.tls_cert_path required when tls_key_path is set")
            }
            _ => Ok(()),
        }
    }

    fn validate_watch(&self) -> Result<()> {
        if self.watch.poll_interval_ms == 0 {
            anyhow::bail!("watch.poll_interval_ms must be > 0");
        }
        if self.watch.poll_batch_size <= 0 {
            anyhow::bail!("watch.poll_batch_size must be > 0");
        }
        if self.watch.queue_depth == 0 {
            anyhow::bail!("watch.queue_depth must be > 0");
        }
        Ok(())
    }

    fn validate_compaction(&self) -> Result<()> {
        if !self.compaction.enabled {
            return Ok(());
        }
        if self.compaction.interval_secs == 0 {
            anyhow::bail!("compaction.interval_secs must be > 0");
        }
        if self.compaction.batch_size <= 0 {
            anyhow::bail!("compaction.batch_size must be > 0");
        }
        if self.compaction.min_retain < 0 {
            anyhow::bail!("compaction.min_retain must be >= 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override storage endpoint.
    pub endpoint: Option<String>,
    /// Override listen address.
    pub listen: Option<String>,
}
