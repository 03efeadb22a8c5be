//! etcd lease operations.
//!
//! Leases are not tracked. LeaseGrant succeeds by echoing the requested
//! TTL as both the lease ID and the TTL, so a key written with that lease
//! records its TTL in the `lease` column. Every other lease RPC is
//! rejected as unsupported.

use super::grpc::SharedState;
use super::proto;
use crate::core::error::StrataResult;

/// Lease RPCs that are answered with UNIMPLEMENTED.
pub const UNSUPPORTED_METHODS: &[&str] = &[
    "LeaseRevoke",
    "LeaseKeepAlive",
    "LeaseTimeToLive",
    "LeaseLeases",
];

/// Handlers for the Lease service.
#[derive(Debug, Clone)]
pub struct LeaseService {
    state: SharedState,
}

impl LeaseService {
    /// Create a new Lease service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle LeaseGrant.
    pub async fn grant(
        &self,
        req: proto::LeaseGrantRequest,
    ) -> StrataResult<proto::LeaseGrantResponse> {
        let revision = self.state.backend.current_revision().await?;
        tracing::trace!(ttl = req.ttl, "lease granted");
        Ok(proto::LeaseGrantResponse {
            header: Some(self.state.header(revision)),
            id: req.ttl,
            ttl: req.ttl,
            error: String::new(),
        })
    }
}
