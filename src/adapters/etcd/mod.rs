//! etcd v3 gRPC adapter.
//!
//! Exposes the subset of the etcd v3 API that Kubernetes' storage layer
//! uses, backed by the revisioned SQL store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      etcd v3 gRPC                           │
//! ├────────────┬────────────┬──────────┬──────────┬─────────────┤
//! │     KV     │   Watch    │  Lease   │ Cluster  │ Maintenance │
//! │ Range/Put  │  Create    │  Grant   │ Member   │   Status    │
//! │ Delete/Txn │  Cancel    │  (echo)  │  List    │             │
//! │  Compact   │  Progress  │          │          │             │
//! └────────────┴────────────┴──────────┴──────────┴─────────────┘
//!        │            │
//!   mvcc::Backend  watch::WatchHub
//! ```
//!
//! # Modules
//!
//! - [`grpc`] - tonic service routing, shared state and server bring-up
//! - [`kv`] - Range, Put, DeleteRange, Compact
//! - [`txn`] - Txn shape matching
//! - [`watch`] - Watch stream bridge
//! - [`lease`] - LeaseGrant
//! - [`cluster`] - MemberList
//! - [`maintenance`] - Status
//! - [`errors`] - Error mapping to gRPC status codes
//! - [`proto`] - Wire messages

pub mod cluster;
pub mod errors;
pub mod grpc;
pub mod kv;
pub mod lease;
pub mod maintenance;
pub mod proto;
pub mod txn;
pub mod watch;

pub use cluster::ClusterService;
pub use errors::to_status;
pub use grpc::{EtcdGrpcServer, SharedState};
pub use kv::KvService;
pub use lease::LeaseService;
pub use maintenance::MaintenanceService;
pub use watch::WatchService;
