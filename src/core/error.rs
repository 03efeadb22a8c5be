//! Error types.
//!
//! Every layer below the etcd adapter returns [`StrataError`]. Only the
//! adapter turns these into protocol-visible `tonic::Status` values (see
//! `adapters::etcd::errors`).

use thiserror::Error;

/// Common Strata error conditions.
#[derive(Debug, Error)]
pub enum StrataError {
    /// A create found a live record for the key.
    #[error("key exists")]
    KeyExists,

    /// The requested revision is older than the compaction revision.
    #[error("revision {revision} has been compacted; compaction revision is {compact_revision}")]
    RevisionCompacted {
        revision: i64,
        compact_revision: i64,
    },

    /// The requested revision has not been written yet.
    #[error("revision {revision} is in the future; current revision is {current_revision}")]
    FutureRevision {
        revision: i64,
        current_revision: i64,
    },

    /// A request shape or RPC that this server does not implement.
    #[error("{operation} is not supported")]
    Unsupported { operation: String },

    /// Malformed request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A watch fell behind the shared event feed and was dropped.
    #[error("watch {watch_id} lagged behind the event feed")]
    WatchLagged { watch_id: i64 },

    /// Error returned by the SQL driver after retries were exhausted.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl StrataError {
    /// Create an Unsupported error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is a compare-style outcome rather than a failure.
    pub fn is_compare_outcome(&self) -> bool {
        matches!(self, Self::KeyExists)
    }

    /// Check if this error reports a unique-index violation from the database.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Storage(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type using StrataError.
pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StrataError::RevisionCompacted {
            revision: 3,
            compact_revision: 10,
        };
        assert!(err.to_string().contains("compacted"));

        let err = StrataError::unsupported("LeaseRevoke");
        assert_eq!(err.to_string(), "LeaseRevoke is not supported");
    }

    #[test]
    fn test_compare_outcome() {
        assert!(StrataError::KeyExists.is_compare_outcome());
        assert!(!StrataError::internal("boom").is_compare_outcome());
        assert!(!StrataError::KeyExists.is_unique_violation());
    }
}
