//! etcd adapter tests, driving the service handlers directly.

mod common;

use strata::adapters::etcd::proto::{
    self, compare, event::EventType, request_op, response_op, watch_request,
};
use strata::adapters::etcd::{
    to_status, ClusterService, KvService, LeaseService, MaintenanceService, SharedState,
    WatchService,
};
use strata::core::error::StrataError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Code, Status};

// ============================================================================
// Request builders
// ============================================================================

fn mod_compare(key: &str, revision: i64) -> proto::Compare {
    proto::Compare {
        result: compare::CompareResult::Equal as i32,
        target: compare::CompareTarget::Mod as i32,
        key: key.as_bytes().to_vec(),
        target_union: Some(compare::TargetUnion::ModRevision(revision)),
        ..Default::default()
    }
}

fn put_op(key: &str, value: &str) -> proto::RequestOp {
    proto::RequestOp {
        request: Some(request_op::Request::RequestPut(proto::PutRequest {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            ..Default::default()
        })),
    }
}

fn range_op(key: &str) -> proto::RequestOp {
    proto::RequestOp {
        request: Some(request_op::Request::RequestRange(proto::RangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        })),
    }
}

fn delete_op(key: &str) -> proto::RequestOp {
    proto::RequestOp {
        request: Some(request_op::Request::RequestDeleteRange(
            proto::DeleteRangeRequest {
                key: key.as_bytes().to_vec(),
                ..Default::default()
            },
        )),
    }
}

fn create_txn(key: &str, value: &str) -> proto::TxnRequest {
    proto::TxnRequest {
        compare: vec![mod_compare(key, 0)],
        success: vec![put_op(key, value)],
        failure: vec![],
    }
}

fn update_txn(key: &str, value: &str, revision: i64) -> proto::TxnRequest {
    proto::TxnRequest {
        compare: vec![mod_compare(key, revision)],
        success: vec![put_op(key, value)],
        failure: vec![range_op(key)],
    }
}

fn get(key: &str) -> proto::RangeRequest {
    proto::RangeRequest {
        key: key.as_bytes().to_vec(),
        ..Default::default()
    }
}

fn list(key: &str, range_end: &str, limit: i64) -> proto::RangeRequest {
    proto::RangeRequest {
        key: key.as_bytes().to_vec(),
        range_end: range_end.as_bytes().to_vec(),
        limit,
        ..Default::default()
    }
}

fn revision_of(header: &Option<proto::ResponseHeader>) -> i64 {
    header.as_ref().map_or(0, |h| h.revision)
}

fn only_range(resp: &proto::TxnResponse) -> &proto::RangeResponse {
    match resp.responses.as_slice() {
        [proto::ResponseOp {
            response: Some(response_op::Response::ResponseRange(range)),
        }] => range,
        other => panic!("expected a single range response, got {other:?}"),
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    _watching: common::Watching,
    shutdown: tokio::sync::watch::Sender<bool>,
    state: SharedState,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let backend = common::open_backend(&dir).await;
    let watching = common::start_watching(&backend).await;
    let (state, shutdown) = common::shared_state(&backend, &watching.hub);
    Fixture {
        _dir: dir,
        _watching: watching,
        shutdown,
        state,
    }
}

// ============================================================================
// Txn shapes
// ============================================================================

#[tokio::test]
async fn txn_create_then_conflict() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let created = kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    assert!(created.succeeded);
    assert_eq!(revision_of(&created.header), 2);

    let again = kv.txn(create_txn("/registry/a", "v2")).await.unwrap();
    assert!(!again.succeeded);

    let current = kv.range(get("/registry/a")).await.unwrap();
    assert_eq!(current.kvs[0].value, b"v1");
}

#[tokio::test]
async fn txn_update_success_and_stale() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let created = kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    let rev = revision_of(&created.header);

    let updated = kv.txn(update_txn("/registry/a", "v2", rev)).await.unwrap();
    assert!(updated.succeeded);
    let new_rev = revision_of(&updated.header);
    assert!(new_rev > rev);

    // A writer still holding the old revision loses and sees the current value.
    let stale = kv.txn(update_txn("/registry/a", "v3", rev)).await.unwrap();
    assert!(!stale.succeeded);
    let range = only_range(&stale);
    assert_eq!(range.kvs.len(), 1);
    assert_eq!(range.kvs[0].value, b"v2");
    assert_eq!(range.kvs[0].mod_revision, new_rev);
    assert_eq!(range.kvs[0].create_revision, rev);
}

#[tokio::test]
async fn txn_conditional_delete() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let created = kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    let rev = revision_of(&created.header);

    let wrong = proto::TxnRequest {
        compare: vec![mod_compare("/registry/a", rev + 50)],
        success: vec![delete_op("/registry/a")],
        failure: vec![range_op("/registry/a")],
    };
    let refused = kv.txn(wrong).await.unwrap();
    assert!(!refused.succeeded);
    assert_eq!(only_range(&refused).kvs[0].mod_revision, rev);

    let right = proto::TxnRequest {
        compare: vec![mod_compare("/registry/a", rev)],
        success: vec![delete_op("/registry/a")],
        failure: vec![range_op("/registry/a")],
    };
    let deleted = kv.txn(right).await.unwrap();
    assert!(deleted.succeeded);
    match deleted.responses[0].response.as_ref() {
        Some(response_op::Response::ResponseDeleteRange(resp)) => {
            assert_eq!(resp.deleted, 1);
            assert_eq!(resp.prev_kvs[0].value, b"v1");
        }
        other => panic!("expected delete response, got {other:?}"),
    }

    assert!(kv.range(get("/registry/a")).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn txn_unconditional_delete() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    kv.txn(create_txn("/registry/a", "v1")).await.unwrap();

    let req = proto::TxnRequest {
        compare: vec![],
        success: vec![range_op("/registry/a"), delete_op("/registry/a")],
        failure: vec![],
    };
    let resp = kv.txn(req.clone()).await.unwrap();
    assert!(resp.succeeded);
    assert_eq!(resp.responses.len(), 2);

    // Deleting again still succeeds, with nothing removed.
    let again = kv.txn(req).await.unwrap();
    assert!(again.succeeded);
    match again.responses[1].response.as_ref() {
        Some(response_op::Response::ResponseDeleteRange(resp)) => assert_eq!(resp.deleted, 0),
        other => panic!("expected delete response, got {other:?}"),
    }
}

#[tokio::test]
async fn txn_compaction_marker_is_acknowledged() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let req = proto::TxnRequest {
        compare: vec![proto::Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Version as i32,
            key: b"compact_rev_key".to_vec(),
            target_union: Some(compare::TargetUnion::Version(0)),
            ..Default::default()
        }],
        success: vec![put_op("compact_rev_key", "5")],
        failure: vec![range_op("compact_rev_key")],
    };
    let before = fx.state.backend.current_revision().await.unwrap();
    let resp = kv.txn(req).await.unwrap();
    assert!(!resp.succeeded);
    assert_eq!(only_range(&resp).kvs[0].key, b"compact_rev_key");
    assert_eq!(fx.state.backend.current_revision().await.unwrap(), before);
}

#[tokio::test]
async fn txn_unknown_shape_is_unimplemented() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let req = proto::TxnRequest {
        compare: vec![mod_compare("/a", 1), mod_compare("/b", 1)],
        success: vec![put_op("/a", "v")],
        failure: vec![],
    };
    let err = kv.txn(req).await.unwrap_err();
    assert!(matches!(err, StrataError::Unsupported { .. }));
    let status = to_status(&err);
    assert_eq!(status.code(), Code::Unimplemented);
    assert_eq!(status.message(), "unsupported transaction");
}

#[tokio::test]
async fn txn_compare_on_another_key_is_unimplemented() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    assert!(kv.txn(create_txn("/x", "live")).await.unwrap().succeeded);

    let req = proto::TxnRequest {
        compare: vec![mod_compare("/x", 0)],
        success: vec![put_op("/a", "v")],
        failure: vec![],
    };
    let err = kv.txn(req).await.unwrap_err();
    assert_eq!(to_status(&err).message(), "unsupported transaction");

    let req = proto::TxnRequest {
        compare: vec![mod_compare("/x", 2)],
        success: vec![delete_op("/a")],
        failure: vec![range_op("/a")],
    };
    assert!(matches!(
        kv.txn(req).await,
        Err(StrataError::Unsupported { .. })
    ));

    // Nothing was written to the key the compare did not name.
    let current = kv.range(get("/a")).await.unwrap();
    assert!(current.kvs.is_empty());
}

// ============================================================================
// Range
// ============================================================================

#[tokio::test]
async fn range_pages_through_prefix() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    for name in ["a", "b", "c", "d", "e"] {
        kv.txn(create_txn(&format!("/registry/pods/{name}"), name))
            .await
            .unwrap();
    }
    kv.txn(create_txn("/registry/podsx", "other")).await.unwrap();

    let first = kv
        .range(list("/registry/pods/", "/registry/pods0", 2))
        .await
        .unwrap();
    let keys: Vec<&[u8]> = first.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, [b"/registry/pods/a".as_slice(), b"/registry/pods/b"]);
    assert!(first.more);
    assert_eq!(first.count, 5);

    let second = kv
        .range(list("/registry/pods/b\0", "/registry/pods0", 2))
        .await
        .unwrap();
    let keys: Vec<&[u8]> = second.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, [b"/registry/pods/c".as_slice(), b"/registry/pods/d"]);
    assert!(second.more);

    let last = kv
        .range(list("/registry/pods/d\0", "/registry/pods0", 2))
        .await
        .unwrap();
    assert_eq!(last.kvs.len(), 1);
    assert_eq!(last.kvs[0].key, b"/registry/pods/e");
    assert!(!last.more);
}

#[tokio::test]
async fn range_count_only_and_keys_only() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    for name in ["a", "b", "c"] {
        kv.txn(create_txn(&format!("/registry/x/{name}"), "value"))
            .await
            .unwrap();
    }

    let counted = kv
        .range(proto::RangeRequest {
            count_only: true,
            ..list("/registry/x/", "/registry/x0", 0)
        })
        .await
        .unwrap();
    assert!(counted.kvs.is_empty());
    assert_eq!(counted.count, 3);

    let keys = kv
        .range(proto::RangeRequest {
            keys_only: true,
            ..list("/registry/x/", "/registry/x0", 0)
        })
        .await
        .unwrap();
    assert_eq!(keys.kvs.len(), 3);
    assert!(keys.kvs.iter().all(|kv| kv.value.is_empty()));
}

#[tokio::test]
async fn range_at_revision_and_compacted() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let created = kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    let rev = revision_of(&created.header);
    kv.txn(update_txn("/registry/a", "v2", rev)).await.unwrap();

    let old = kv
        .range(proto::RangeRequest {
            revision: rev,
            ..get("/registry/a")
        })
        .await
        .unwrap();
    assert_eq!(old.kvs[0].value, b"v1");

    fx.state
        .backend
        .tracker()
        .set_compact_revision(rev + 1)
        .await
        .unwrap();
    let err = kv
        .range(proto::RangeRequest {
            revision: rev,
            ..get("/registry/a")
        })
        .await
        .unwrap_err();
    assert_eq!(to_status(&err).code(), Code::OutOfRange);
}

// ============================================================================
// Put / DeleteRange
// ============================================================================

#[tokio::test]
async fn put_creates_then_replaces() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());

    let first = kv
        .put(proto::PutRequest {
            key: b"/a".to_vec(),
            value: b"1".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(first.prev_kv.is_none());

    let second = kv
        .put(proto::PutRequest {
            key: b"/a".to_vec(),
            value: b"2".to_vec(),
            prev_kv: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.prev_kv.unwrap().value, b"1");
    assert!(revision_of(&second.header) > revision_of(&first.header));

    let current = kv.range(get("/a")).await.unwrap();
    assert_eq!(current.kvs[0].value, b"2");
    assert_eq!(current.count, 1);
}

#[tokio::test]
async fn delete_range_single_key() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    kv.txn(create_txn("/a", "1")).await.unwrap();

    let resp = kv
        .delete_range(proto::DeleteRangeRequest {
            key: b"/a".to_vec(),
            prev_kv: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.deleted, 1);
    assert_eq!(resp.prev_kvs[0].value, b"1");

    let ranged = kv
        .delete_range(proto::DeleteRangeRequest {
            key: b"/".to_vec(),
            range_end: b"0".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(ranged, StrataError::Unsupported { .. }));
}

// ============================================================================
// Lease, Cluster, Maintenance
// ============================================================================

#[tokio::test]
async fn lease_grant_echoes_ttl() {
    let fx = fixture().await;
    let lease = LeaseService::new(fx.state.clone());

    let resp = lease
        .grant(proto::LeaseGrantRequest { ttl: 30, id: 0 })
        .await
        .unwrap();
    assert_eq!(resp.id, 30);
    assert_eq!(resp.ttl, 30);
    assert!(resp.error.is_empty());
}

#[tokio::test]
async fn member_list_has_one_member() {
    let fx = fixture().await;
    let cluster = ClusterService::new(fx.state.clone());

    let resp = cluster
        .member_list(proto::MemberListRequest::default())
        .await
        .unwrap();
    assert_eq!(resp.members.len(), 1);
    assert_eq!(resp.members[0].id, fx.state.member_id);
    assert_eq!(resp.members[0].client_urls, ["http://127.0.0.1:2379"]);
}

#[tokio::test]
async fn status_reports_revision() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    let maintenance = MaintenanceService::new(fx.state.clone());
    let created = kv.txn(create_txn("/a", "1")).await.unwrap();

    let status = maintenance.status(proto::StatusRequest {}).await.unwrap();
    assert_eq!(revision_of(&status.header), revision_of(&created.header));
    assert_eq!(status.raft_index, revision_of(&created.header) as u64);
    assert!(!status.version.is_empty());
    assert_eq!(status.leader, fx.state.member_id);
}

// ============================================================================
// Watch stream
// ============================================================================

type Requests = mpsc::Sender<Result<proto::WatchRequest, Status>>;
type Responses = ReceiverStream<Result<proto::WatchResponse, Status>>;

fn open_watch(state: &SharedState) -> (Requests, Responses) {
    let (tx, rx) = mpsc::channel(16);
    let responses = WatchService::new(state.clone()).open(ReceiverStream::new(rx));
    (tx, responses)
}

async fn send_create(requests: &Requests, create: proto::WatchCreateRequest) {
    requests
        .send(Ok(proto::WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(create)),
        }))
        .await
        .unwrap();
}

async fn next_frame(responses: &mut Responses) -> proto::WatchResponse {
    tokio::time::timeout(common::DELIVERY_TIMEOUT, responses.next())
        .await
        .expect("timed out waiting for a watch response")
        .expect("watch stream ended")
        .expect("watch stream failed")
}

#[tokio::test]
async fn watch_stream_delivers_events() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    let (requests, mut responses) = open_watch(&fx.state);

    send_create(
        &requests,
        proto::WatchCreateRequest {
            key: b"/registry/".to_vec(),
            range_end: b"/registry0".to_vec(),
            prev_kv: true,
            ..Default::default()
        },
    )
    .await;
    let created = next_frame(&mut responses).await;
    assert!(created.created);
    assert!(!created.canceled);
    let watch_id = created.watch_id;

    let first = kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    let rev = revision_of(&first.header);
    kv.txn(update_txn("/registry/a", "v2", rev)).await.unwrap();

    let mut events = Vec::new();
    let mut header_revision = 0;
    while events.len() < 2 {
        let frame = next_frame(&mut responses).await;
        assert_eq!(frame.watch_id, watch_id);
        header_revision = revision_of(&frame.header);
        events.extend(frame.events);
    }
    assert_eq!(events[0].r#type, EventType::Put as i32);
    assert!(events[0].prev_kv.is_none());
    let update = &events[1];
    assert_eq!(update.kv.as_ref().unwrap().value, b"v2");
    assert_eq!(update.prev_kv.as_ref().unwrap().value, b"v1");
    assert_eq!(header_revision, update.kv.as_ref().unwrap().mod_revision);

    // Cancel and expect the confirmation.
    requests
        .send(Ok(proto::WatchRequest {
            request_union: Some(watch_request::RequestUnion::CancelRequest(
                proto::WatchCancelRequest { watch_id },
            )),
        }))
        .await
        .unwrap();
    let cancelled = next_frame(&mut responses).await;
    assert!(cancelled.canceled);
    assert_eq!(cancelled.watch_id, watch_id);
    // Stamped with the feed position, which has passed every delivered event.
    assert!(revision_of(&cancelled.header) >= header_revision);
}

#[tokio::test]
async fn watch_stream_delete_carries_previous_value() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    kv.txn(create_txn("/registry/a", "v1")).await.unwrap();
    let (requests, mut responses) = open_watch(&fx.state);

    send_create(
        &requests,
        proto::WatchCreateRequest {
            key: b"/registry/a".to_vec(),
            ..Default::default()
        },
    )
    .await;
    assert!(next_frame(&mut responses).await.created);

    kv.delete_range(proto::DeleteRangeRequest {
        key: b"/registry/a".to_vec(),
        ..Default::default()
    })
    .await
    .unwrap();

    let frame = next_frame(&mut responses).await;
    assert_eq!(frame.events.len(), 1);
    let event = &frame.events[0];
    assert_eq!(event.r#type, EventType::Delete as i32);
    assert_eq!(event.prev_kv.as_ref().unwrap().value, b"v1");
}

#[tokio::test]
async fn watch_below_compaction_is_cancelled() {
    let fx = fixture().await;
    let kv = KvService::new(fx.state.clone());
    for name in ["a", "b", "c"] {
        kv.txn(create_txn(&format!("/registry/{name}"), "v"))
            .await
            .unwrap();
    }
    fx.state
        .backend
        .tracker()
        .set_compact_revision(4)
        .await
        .unwrap();
    let (requests, mut responses) = open_watch(&fx.state);

    send_create(
        &requests,
        proto::WatchCreateRequest {
            key: b"/registry/".to_vec(),
            range_end: b"/registry0".to_vec(),
            start_revision: 2,
            ..Default::default()
        },
    )
    .await;
    let frame = next_frame(&mut responses).await;
    assert!(frame.created);
    assert!(frame.canceled);
    assert_eq!(frame.compact_revision, 4);
    let stamped = revision_of(&frame.header);
    assert!(stamped > 0 && stamped <= fx.state.hub.cursor());
}

#[tokio::test]
async fn watch_progress_request() {
    let fx = fixture().await;
    let (requests, mut responses) = open_watch(&fx.state);

    requests
        .send(Ok(proto::WatchRequest {
            request_union: Some(watch_request::RequestUnion::ProgressRequest(
                proto::WatchProgressRequest {},
            )),
        }))
        .await
        .unwrap();
    let frame = next_frame(&mut responses).await;
    assert_eq!(frame.watch_id, -1);
    assert_eq!(revision_of(&frame.header), fx.state.hub.cursor());
}

#[tokio::test]
async fn watch_stream_ends_on_shutdown() {
    let fx = fixture().await;
    let (_requests, mut responses) = open_watch(&fx.state);

    fx.shutdown.send(true).unwrap();
    let end = tokio::time::timeout(common::DELIVERY_TIMEOUT, responses.next())
        .await
        .expect("stream did not end");
    assert!(end.is_none());
}
