//! etcd transaction operations.
//!
//! Txn is not a general compare/then/else evaluator here. The request is
//! matched against the shapes Kubernetes' storage layer issues and each
//! shape maps onto one engine operation:
//!
//! | shape                                         | operation     |
//! |-----------------------------------------------|---------------|
//! | `mod(k) == 0` then put                        | create        |
//! | `mod(k) == r` then put, else range            | update        |
//! | then range + delete                           | delete        |
//! | `mod(k) == r` then delete, else range         | delete at `r` |
//! | compare on `compact_rev_key`                  | compaction ack|
//!
//! Anything else is rejected as `unsupported transaction`.

use super::kv::{key_str, key_value, KvService};
use super::proto::{self, compare, request_op, response_op};
use crate::core::error::{StrataError, StrataResult};
use crate::mvcc::Record;
use crate::storage::statements::COMPACT_REV_KEY;

/// A recognised transaction.
#[derive(Debug, PartialEq)]
pub(crate) enum TxnShape<'a> {
    Create(&'a proto::PutRequest),
    Update {
        revision: i64,
        put: &'a proto::PutRequest,
    },
    Delete {
        key: &'a [u8],
        /// Required mod revision; `None` deletes unconditionally.
        revision: Option<i64>,
    },
    Compact,
}

/// The revision of a `mod(key) == revision` compare.
fn mod_equals(cmp: &proto::Compare) -> Option<i64> {
    if cmp.target() != compare::CompareTarget::Mod || cmp.result() != compare::CompareResult::Equal {
        return None;
    }
    match cmp.target_union {
        Some(compare::TargetUnion::ModRevision(revision)) => Some(revision),
        None => Some(0),
        Some(_) => None,
    }
}

fn ops(ops: &[proto::RequestOp]) -> StrataResult<Vec<&request_op::Request>> {
    ops.iter()
        .map(|op| op.request.as_ref())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| StrataError::invalid("empty request op"))
}

/// Whether every range op in `failure` reads exactly `key`.
fn reads_only(failure: &[&request_op::Request], key: &[u8]) -> bool {
    failure.iter().all(|op| match op {
        request_op::Request::RequestRange(range) => range.key == key && range.range_end.is_empty(),
        _ => false,
    })
}

/// Match a transaction against the supported shapes. Compares, writes and
/// reads in one transaction must all name the same key.
pub(crate) fn classify(txn: &proto::TxnRequest) -> StrataResult<TxnShape<'_>> {
    use request_op::Request::{RequestDeleteRange, RequestPut, RequestRange};

    let success = ops(&txn.success)?;
    let failure = ops(&txn.failure)?;

    let shape = match (txn.compare.as_slice(), success.as_slice(), failure.as_slice()) {
        ([cmp], [RequestPut(_)], [RequestRange(_)]) if cmp.key == COMPACT_REV_KEY.as_bytes() => {
            Some(TxnShape::Compact)
        }
        ([cmp], [RequestPut(put)], []) if cmp.key == put.key && mod_equals(cmp) == Some(0) => {
            Some(TxnShape::Create(put))
        }
        ([cmp], [RequestPut(put)], [] | [RequestRange(_)])
            if cmp.key == put.key && reads_only(&failure, &put.key) =>
        {
            mod_equals(cmp).map(|revision| TxnShape::Update { revision, put })
        }
        ([], [RequestRange(range), RequestDeleteRange(delete)], [])
            if delete.range_end.is_empty()
                && range.key == delete.key
                && range.range_end.is_empty() =>
        {
            Some(TxnShape::Delete {
                key: &delete.key,
                revision: None,
            })
        }
        ([cmp], [RequestDeleteRange(delete)], [RequestRange(_)])
            if delete.range_end.is_empty()
                && cmp.key == delete.key
                && reads_only(&failure, &delete.key) =>
        {
            mod_equals(cmp).map(|revision| TxnShape::Delete {
                key: &delete.key,
                revision: Some(revision),
            })
        }
        _ => None,
    };
    shape.ok_or_else(|| StrataError::unsupported("transaction"))
}

fn put_op(response: proto::PutResponse) -> proto::ResponseOp {
    proto::ResponseOp {
        response: Some(response_op::Response::ResponsePut(response)),
    }
}

fn range_op(response: proto::RangeResponse) -> proto::ResponseOp {
    proto::ResponseOp {
        response: Some(response_op::Response::ResponseRange(response)),
    }
}

fn delete_op(response: proto::DeleteRangeResponse) -> proto::ResponseOp {
    proto::ResponseOp {
        response: Some(response_op::Response::ResponseDeleteRange(response)),
    }
}

impl KvService {
    /// Handle Txn.
    pub async fn txn(&self, req: proto::TxnRequest) -> StrataResult<proto::TxnResponse> {
        let shape = match classify(&req) {
            Ok(shape) => shape,
            Err(err) => {
                tracing::debug!(request = ?req, "rejecting transaction");
                return Err(err);
            }
        };

        match shape {
            TxnShape::Create(put) => self.txn_create(put).await,
            TxnShape::Update { revision, put } => self.txn_update(revision, put).await,
            TxnShape::Delete { key, revision } => self.txn_delete(key, revision).await,
            TxnShape::Compact => self.txn_compact().await,
        }
    }

    async fn txn_create(&self, put: &proto::PutRequest) -> StrataResult<proto::TxnResponse> {
        let key = key_str(&put.key)?;
        let state = self.state();
        match state.backend.create(key, &put.value, put.lease).await {
            Ok(revision) => Ok(proto::TxnResponse {
                header: Some(state.header(revision)),
                succeeded: true,
                responses: vec![put_op(proto::PutResponse {
                    header: Some(state.header(revision)),
                    prev_kv: None,
                })],
            }),
            Err(StrataError::KeyExists) => {
                let revision = state.backend.current_revision().await?;
                Ok(proto::TxnResponse {
                    header: Some(state.header(revision)),
                    succeeded: false,
                    responses: Vec::new(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn txn_update(
        &self,
        expected: i64,
        put: &proto::PutRequest,
    ) -> StrataResult<proto::TxnResponse> {
        let key = key_str(&put.key)?;
        let state = self.state();
        let outcome = state
            .backend
            .update(key, &put.value, expected, put.lease)
            .await?;
        let header = state.header(outcome.revision);

        let response = if outcome.matched {
            put_op(proto::PutResponse {
                header: Some(header.clone()),
                prev_kv: outcome.record.as_ref().filter(|_| put.prev_kv).map(key_value),
            })
        } else {
            tracing::trace!(key, expected, "update compare failed");
            range_op(self.current_range(header.clone(), outcome.record.as_ref()))
        };
        Ok(proto::TxnResponse {
            header: Some(header),
            succeeded: outcome.matched,
            responses: vec![response],
        })
    }

    async fn txn_delete(&self, key: &[u8], expected: Option<i64>) -> StrataResult<proto::TxnResponse> {
        let key = key_str(key)?;
        let state = self.state();

        let Some(expected) = expected else {
            // Range then delete: always succeeds, reporting what was removed.
            let outcome = state.backend.delete(key, 0).await?;
            let header = state.header(outcome.revision);
            let prev = outcome.record.as_ref().filter(|_| outcome.matched);
            return Ok(proto::TxnResponse {
                header: Some(header.clone()),
                succeeded: true,
                responses: vec![
                    range_op(self.current_range(header.clone(), prev)),
                    delete_op(proto::DeleteRangeResponse {
                        header: Some(header),
                        deleted: i64::from(prev.is_some()),
                        prev_kvs: prev.map(key_value).into_iter().collect(),
                    }),
                ],
            });
        };

        if expected == 0 {
            // "Delete if absent" holds trivially when there is nothing to delete.
            let (revision, current) = state.backend.get(key, 0).await?;
            let header = state.header(revision);
            return Ok(match current {
                None => proto::TxnResponse {
                    header: Some(header.clone()),
                    succeeded: true,
                    responses: vec![delete_op(proto::DeleteRangeResponse {
                        header: Some(header),
                        deleted: 0,
                        prev_kvs: Vec::new(),
                    })],
                },
                Some(record) => proto::TxnResponse {
                    header: Some(header.clone()),
                    succeeded: false,
                    responses: vec![range_op(self.current_range(header, Some(&record)))],
                },
            });
        }

        let outcome = state.backend.delete(key, expected).await?;
        let header = state.header(outcome.revision);
        let response = if outcome.matched {
            delete_op(proto::DeleteRangeResponse {
                header: Some(header.clone()),
                deleted: 1,
                prev_kvs: outcome.record.iter().map(key_value).collect(),
            })
        } else {
            tracing::trace!(key, expected, "delete compare failed");
            range_op(self.current_range(header.clone(), outcome.record.as_ref()))
        };
        Ok(proto::TxnResponse {
            header: Some(header),
            succeeded: outcome.matched,
            responses: vec![response],
        })
    }

    /// Kubernetes' compactor asks whether another member already compacted.
    /// The answer is always "yes", so it never issues a Compact itself.
    async fn txn_compact(&self) -> StrataResult<proto::TxnResponse> {
        let state = self.state();
        let revision = state.backend.current_revision().await?;
        let header = state.header(revision);
        Ok(proto::TxnResponse {
            header: Some(header.clone()),
            succeeded: false,
            responses: vec![range_op(proto::RangeResponse {
                header: Some(header),
                kvs: vec![proto::KeyValue {
                    key: COMPACT_REV_KEY.as_bytes().to_vec(),
                    ..Default::default()
                }],
                more: false,
                count: 1,
            })],
        })
    }

    fn current_range(
        &self,
        header: proto::ResponseHeader,
        record: Option<&Record>,
    ) -> proto::RangeResponse {
        let kvs: Vec<proto::KeyValue> = record.map(key_value).into_iter().collect();
        proto::RangeResponse {
            header: Some(header),
            count: kvs.len() as i64,
            kvs,
            more: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mod_compare(key: &str, revision: i64) -> proto::Compare {
        proto::Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Mod as i32,
            key: key.as_bytes().to_vec(),
            target_union: Some(compare::TargetUnion::ModRevision(revision)),
            ..Default::default()
        }
    }

    fn put(key: &str) -> proto::RequestOp {
        proto::RequestOp {
            request: Some(request_op::Request::RequestPut(proto::PutRequest {
                key: key.as_bytes().to_vec(),
                value: b"v".to_vec(),
                ..Default::default()
            })),
        }
    }

    fn range(key: &str) -> proto::RequestOp {
        proto::RequestOp {
            request: Some(request_op::Request::RequestRange(proto::RangeRequest {
                key: key.as_bytes().to_vec(),
                ..Default::default()
            })),
        }
    }

    fn delete(key: &str) -> proto::RequestOp {
        proto::RequestOp {
            request: Some(request_op::Request::RequestDeleteRange(
                proto::DeleteRangeRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                },
            )),
        }
    }

    fn txn(
        compare: Vec<proto::Compare>,
        success: Vec<proto::RequestOp>,
        failure: Vec<proto::RequestOp>,
    ) -> proto::TxnRequest {
        proto::TxnRequest {
            compare,
            success,
            failure,
        }
    }

    #[test]
    fn test_create_shape() {
        let req = txn(vec![mod_compare("/a", 0)], vec![put("/a")], vec![]);
        assert!(matches!(classify(&req).unwrap(), TxnShape::Create(p) if p.key == b"/a"));
    }

    #[test]
    fn test_update_shape() {
        let req = txn(vec![mod_compare("/a", 7)], vec![put("/a")], vec![range("/a")]);
        assert!(matches!(
            classify(&req).unwrap(),
            TxnShape::Update { revision: 7, .. }
        ));

        // An update without an else branch is still an update.
        let req = txn(vec![mod_compare("/a", 7)], vec![put("/a")], vec![]);
        assert!(matches!(
            classify(&req).unwrap(),
            TxnShape::Update { revision: 7, .. }
        ));
    }

    #[test]
    fn test_delete_shapes() {
        let req = txn(vec![], vec![range("/a"), delete("/a")], vec![]);
        assert_eq!(
            classify(&req).unwrap(),
            TxnShape::Delete {
                key: b"/a",
                revision: None
            }
        );

        let req = txn(vec![mod_compare("/a", 4)], vec![delete("/a")], vec![range("/a")]);
        assert_eq!(
            classify(&req).unwrap(),
            TxnShape::Delete {
                key: b"/a",
                revision: Some(4)
            }
        );
    }

    #[test]
    fn test_compact_shape() {
        let cmp = proto::Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Version as i32,
            key: COMPACT_REV_KEY.as_bytes().to_vec(),
            target_union: Some(compare::TargetUnion::Version(0)),
            ..Default::default()
        };
        let req = txn(
            vec![cmp],
            vec![put(COMPACT_REV_KEY)],
            vec![range(COMPACT_REV_KEY)],
        );
        assert_eq!(classify(&req).unwrap(), TxnShape::Compact);
    }

    #[test]
    fn test_unsupported_shapes() {
        // Value compare.
        let cmp = proto::Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Value as i32,
            key: b"/a".to_vec(),
            target_union: Some(compare::TargetUnion::Value(b"x".to_vec())),
            ..Default::default()
        };
        let req = txn(vec![cmp], vec![put("/a")], vec![]);
        assert!(matches!(
            classify(&req),
            Err(StrataError::Unsupported { .. })
        ));

        // Two puts.
        let req = txn(vec![mod_compare("/a", 0)], vec![put("/a"), put("/b")], vec![]);
        assert!(classify(&req).is_err());

        // Greater-than compare.
        let mut cmp = mod_compare("/a", 3);
        cmp.result = compare::CompareResult::Greater as i32;
        let req = txn(vec![cmp], vec![put("/a")], vec![range("/a")]);
        assert!(classify(&req).is_err());

        // Empty transaction.
        assert!(classify(&txn(vec![], vec![], vec![])).is_err());
    }

    #[test]
    fn test_mismatched_keys_are_unsupported() {
        let unsupported = |req: proto::TxnRequest| {
            matches!(classify(&req), Err(StrataError::Unsupported { .. }))
        };

        assert!(unsupported(txn(vec![mod_compare("/x", 0)], vec![put("/a")], vec![])));
        assert!(unsupported(txn(
            vec![mod_compare("/x", 7)],
            vec![put("/a")],
            vec![range("/a")]
        )));
        assert!(unsupported(txn(
            vec![mod_compare("/a", 7)],
            vec![put("/a")],
            vec![range("/b")]
        )));
        assert!(unsupported(txn(vec![], vec![range("/b"), delete("/a")], vec![])));
        assert!(unsupported(txn(
            vec![mod_compare("/x", 4)],
            vec![delete("/a")],
            vec![range("/a")]
        )));
        assert!(unsupported(txn(
            vec![mod_compare("/a", 4)],
            vec![delete("/a")],
            vec![range("/x")]
        )));
    }
}
