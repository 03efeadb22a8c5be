//! etcd adapter error mapping.
//!
//! This is the only place a [`StrataError`] becomes protocol-visible. Codes
//! and messages follow what etcd servers return so that client libraries
//! recognise them:
//! - compacted / future revision → OUT_OF_RANGE
//! - unsupported request shapes and RPCs → UNIMPLEMENTED
//! - storage failures after retries → UNAVAILABLE

use crate::core::error::StrataError;
use tonic::{Code, Status};

/// etcd's message for a read below the compaction revision.
pub const ERR_COMPACTED: &str = "etcdserver: mvcc: required revision has been compacted";

/// etcd's message for a read above the current revision.
pub const ERR_FUTURE_REV: &str = "etcdserver: mvcc: required revision is a future revision";

/// Cancel reason sent when a watch is dropped for falling behind.
pub const WATCH_LAGGED_REASON: &str = "watch lagged behind the event feed";

/// Convert a StrataError to a gRPC status.
pub fn to_status(err: &StrataError) -> Status {
    match err {
        StrataError::RevisionCompacted { .. } => Status::new(Code::OutOfRange, ERR_COMPACTED),
        StrataError::FutureRevision { .. } => Status::new(Code::OutOfRange, ERR_FUTURE_REV),
        StrataError::KeyExists => Status::new(Code::AlreadyExists, "etcdserver: key already exists"),
        StrataError::Unsupported { operation } => {
            Status::new(Code::Unimplemented, format!("unsupported {operation}"))
        }
        StrataError::InvalidRequest { message } => Status::new(Code::InvalidArgument, message.clone()),
        StrataError::WatchLagged { .. } => Status::new(Code::Aborted, WATCH_LAGGED_REASON),
        StrataError::Storage(source) => Status::new(Code::Unavailable, source.to_string()),
        StrataError::Internal { message } => Status::new(Code::Internal, message.clone()),
    }
}

impl From<StrataError> for Status {
    fn from(err: StrataError) -> Self {
        to_status(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compacted_maps_to_out_of_range() {
        let status = to_status(&StrataError::RevisionCompacted {
            revision: 2,
            compact_revision: 10,
        });
        assert_eq!(status.code(), Code::OutOfRange);
        assert_eq!(status.message(), ERR_COMPACTED);
    }

    #[test]
    fn test_unsupported_transaction() {
        let status: Status = StrataError::unsupported("transaction").into();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unsupported transaction");
    }

    #[test]
    fn test_storage_is_unavailable() {
        let status = to_status(&StrataError::Storage(sqlx::Error::PoolTimedOut));
        assert_eq!(status.code(), Code::Unavailable);
    }
}
