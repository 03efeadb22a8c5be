//! etcd maintenance: Status only.

use super::grpc::SharedState;
use super::proto;
use crate::core::error::StrataResult;

/// Handlers for the Maintenance service.
#[derive(Debug, Clone)]
pub struct MaintenanceService {
    state: SharedState,
}

impl MaintenanceService {
    /// Create a new Maintenance service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle Status. The reported size is the datastore's own estimate.
    pub async fn status(&self, _req: proto::StatusRequest) -> StrataResult<proto::StatusResponse> {
        let backend = &self.state.backend;
        let revision = backend.current_revision().await?;
        let db_size = backend.db_size().await?;
        Ok(proto::StatusResponse {
            header: Some(self.state.header(revision)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_size,
            db_size_in_use: db_size,
            leader: self.state.member_id,
            raft_index: revision as u64,
            raft_applied_index: revision as u64,
            ..Default::default()
        })
    }
}
