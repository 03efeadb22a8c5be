//! Strata - the etcd v3 API served from a single revisioned SQL table.
//!
//! Strata lets software that expects an etcd backend (most notably a
//! Kubernetes API server) run against an ordinary relational database:
//! embedded SQLite, PostgreSQL or MySQL. Every change appends one row to a
//! `kine` table; the row id is the global revision, so the table is both
//! the current state and the change log that watches tail.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     etcd v3 gRPC clients                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   gRPC Bridge (adapters::etcd)                  │
//! │     KV │ Txn shapes │ Watch streams │ Lease │ Cluster │ Status   │
//! └─────────────────────────────────────────────────────────────────┘
//!                 │                                 │
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │   Transaction Engine (mvcc)   │ │   Watch Multiplexer (watch)   │
//! │ Create │ Update │ Delete │ List│ │  shared poller │ fan-out      │
//! └───────────────────────────────┘ └───────────────────────────────┘
//!                 │                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Revisioned Store Driver (storage)                │
//! │        dialects │ statements │ write coordinator │ compaction   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::error`] - Error types
//!
//! ## Storage
//! - [`storage::endpoint`] - Endpoint parsing and pool bring-up
//! - [`storage::dialect`] - SQLite, PostgreSQL and MySQL capabilities
//! - [`storage::driver`] - Retried execution against the revision table
//! - [`storage::compaction`] - Compaction revision and background compactor
//!
//! ## MVCC
//! - [`mvcc::record`] - Revision records
//! - [`mvcc::backend`] - Compare-on-revision writes and point-in-time reads
//!
//! ## Watch
//! - [`watch::hub`] - Watch registry and fan-out
//! - [`watch::poller`] - Shared poller with revision gap handling
//!
//! ## Adapters
//! - [`adapters::etcd`] - etcd v3 gRPC adapter
//!
//! ## Networking
//! - [`net::listener`] - TCP and UNIX socket listeners, TLS identity
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Revisions are strictly increasing and never reused.
//! - At most one row per key has a given `prev_revision`, so concurrent
//!   writers against the same revision cannot both win.
//! - Each watch observes events in revision order, without gaps or
//!   duplicates, until it is cancelled.

// Core infrastructure
pub mod core;

// Storage layer
pub mod storage;

// Revisioned key-value model
pub mod mvcc;

// Watch multiplexer
pub mod watch;

// Protocol adapters
pub mod adapters;

// Networking
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use adapters::etcd;
pub use mvcc::{Backend, Record};
pub use watch::WatchHub;
