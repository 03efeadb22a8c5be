//! Networking layer.
//!
//! - [`listener`] - TCP / UNIX socket listeners and TLS identity loading

pub mod listener;

pub use listener::{BoundListener, ListenAddress, TlsIdentity};
