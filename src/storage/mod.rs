//! Storage layer.
//!
//! Everything is kept in one append-only SQL table, `kine`. Each row is an
//! immutable [`Record`](crate::mvcc::Record) whose `id` is the global
//! revision.
//!
//! # Modules
//!
//! - [`endpoint`] - Endpoint parsing and pool bring-up
//! - [`dialect`] - Per-engine capabilities (SQLite, PostgreSQL, MySQL)
//! - [`statements`] - SQL text
//! - [`driver`] - Retried execution against the revision table
//! - [`compaction`] - Compaction revision tracking and the background compactor

pub mod compaction;
pub mod dialect;
pub mod driver;
pub mod endpoint;
pub mod statements;

// Re-exports for convenience
pub use compaction::{CompactionPolicy, Compactor, RevisionTracker};
pub use dialect::{Dialect, InsertStrategy, MysqlDialect, PostgresDialect, SqliteDialect};
pub use driver::{Driver, NewRecord, RetryPolicy, WriteCoordinator};
pub use endpoint::{connect, Endpoint, Engine};
pub use statements::{COMPACT_REV_KEY, GAP_KEY_PREFIX};
