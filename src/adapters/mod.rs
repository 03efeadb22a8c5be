//! Protocol adapters.
//!
//! Adapters translate an external wire protocol onto the key-value engine
//! and the watch hub. Only the etcd v3 gRPC adapter exists today.
//!
//! - [`etcd`] - etcd v3 gRPC adapter

pub mod etcd;
