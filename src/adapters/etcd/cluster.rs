//! etcd cluster membership.
//!
//! This server is always a single-member cluster. MemberList describes that
//! member from the listener configuration; membership changes are rejected.

use super::grpc::SharedState;
use super::proto;
use crate::core::error::StrataResult;

/// Cluster RPCs that are answered with UNIMPLEMENTED.
pub const UNSUPPORTED_METHODS: &[&str] = &["MemberAdd", "MemberRemove", "MemberUpdate", "MemberPromote"];

/// Handlers for the Cluster service.
#[derive(Debug, Clone)]
pub struct ClusterService {
    state: SharedState,
}

impl ClusterService {
    /// Create a new Cluster service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// The one member of this cluster.
    pub fn member(&self) -> proto::Member {
        proto::Member {
            id: self.state.member_id,
            name: self.state.member_name.clone(),
            peer_urls: Vec::new(),
            client_urls: vec![self.state.client_url.clone()],
            is_learner: false,
        }
    }

    /// Handle MemberList.
    pub async fn member_list(
        &self,
        _req: proto::MemberListRequest,
    ) -> StrataResult<proto::MemberListResponse> {
        let revision = self.state.backend.current_revision().await?;
        Ok(proto::MemberListResponse {
            header: Some(self.state.header(revision)),
            members: vec![self.member()],
        })
    }
}
