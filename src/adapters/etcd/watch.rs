//! etcd Watch stream bridge.
//!
//! Each client stream gets a session task reading create/cancel/progress
//! requests. Every created watch gets a pump task draining its batches from
//! the [`WatchHub`](crate::watch::WatchHub) into `WatchResponse` frames.
//! All frames for a stream share one outbound channel.

use super::errors::WATCH_LAGGED_REASON;
use super::grpc::{shutdown_signalled, SharedState};
use super::kv::{key_value, previous_key_value};
use super::proto::{self, event::EventType, watch_create_request::FilterType, watch_request};
use crate::core::error::StrataError;
use crate::mvcc::Record;
use crate::watch::{EventFilters, KeyFilter, Watch};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Frames buffered per client stream.
const STREAM_BUFFER: usize = 128;

/// Watch id reported on progress responses.
const PROGRESS_WATCH_ID: i64 = -1;

type Outbound = mpsc::Sender<Result<proto::WatchResponse, Status>>;

/// What a watch delivers besides the changed key.
#[derive(Debug, Clone, Copy, Default)]
struct Delivery {
    filters: EventFilters,
    prev_kv: bool,
}

impl Delivery {
    fn from_request(req: &proto::WatchCreateRequest) -> Self {
        let filters = req
            .filters()
            .map(|filter| match filter {
                FilterType::Noput => EventFilters::NOPUT,
                FilterType::Nodelete => EventFilters::NODELETE,
            })
            .fold(EventFilters::empty(), |acc, f| acc | f);
        Self {
            filters,
            prev_kv: req.prev_kv,
        }
    }

    /// Deletes always carry the removed value; puts only on request.
    fn event(&self, record: &Record) -> Option<proto::Event> {
        if !self.filters.allows(record.deleted) {
            return None;
        }
        let (kind, prev_kv) = if record.deleted {
            (EventType::Delete, previous_key_value(record))
        } else if self.prev_kv && !record.created {
            (EventType::Put, previous_key_value(record))
        } else {
            (EventType::Put, None)
        };
        Some(proto::Event {
            r#type: kind as i32,
            kv: Some(key_value(record)),
            prev_kv,
        })
    }
}

/// Handlers for the Watch service.
#[derive(Debug, Clone)]
pub struct WatchService {
    state: SharedState,
}

impl WatchService {
    /// Create a new Watch service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve one client stream. The returned stream ends when the client
    /// goes away or the server shuts down.
    pub fn open<S>(&self, requests: S) -> ReceiverStream<Result<proto::WatchResponse, Status>>
    where
        S: Stream<Item = Result<proto::WatchRequest, Status>> + Send + Unpin + 'static,
    {
        let (out, rx) = mpsc::channel(STREAM_BUFFER);
        let session = Session {
            state: self.state.clone(),
            out,
            watches: HashMap::new(),
        };
        tokio::spawn(session.run(requests));
        ReceiverStream::new(rx)
    }
}

struct Session {
    state: SharedState,
    out: Outbound,
    watches: HashMap<i64, CancellationToken>,
}

impl Session {
    async fn run<S>(mut self, mut requests: S)
    where
        S: Stream<Item = Result<proto::WatchRequest, Status>> + Unpin,
    {
        let mut shutdown = self.state.shutdown_rx.clone();
        loop {
            let request = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = self.out.closed() => break,
                request = requests.next() => request,
            };
            match request {
                Some(Ok(request)) => {
                    if !self.handle(request).await {
                        break;
                    }
                }
                Some(Err(status)) => {
                    tracing::debug!(%status, "watch stream receive failed");
                    break;
                }
                None => break,
            }
        }

        for (_, token) in self.watches.drain() {
            token.cancel();
        }
        tracing::debug!("watch stream closed");
    }

    /// Returns false once the client can no longer be reached.
    async fn handle(&mut self, request: proto::WatchRequest) -> bool {
        match request.request_union {
            Some(watch_request::RequestUnion::CreateRequest(create)) => self.create(create).await,
            Some(watch_request::RequestUnion::CancelRequest(cancel)) => {
                self.cancel(cancel.watch_id).await
            }
            Some(watch_request::RequestUnion::ProgressRequest(_)) => self.progress().await,
            None => true,
        }
    }

    async fn send(&self, response: proto::WatchResponse) -> bool {
        self.out.send(Ok(response)).await.is_ok()
    }

    async fn create(&mut self, req: proto::WatchCreateRequest) -> bool {
        self.watches.retain(|_, token| !token.is_cancelled());

        let delivery = Delivery::from_request(&req);
        let filter = KeyFilter::new(req.key.clone(), req.range_end.clone());
        let watch = match self.state.hub.register(filter, req.start_revision).await {
            Ok(watch) => watch,
            Err(err) => return self.reject(&req, err).await,
        };

        let id = watch.id();
        tracing::debug!(
            watch_id = id,
            key = %String::from_utf8_lossy(&req.key),
            start_revision = req.start_revision,
            "watch created"
        );
        let created = proto::WatchResponse {
            header: Some(self.state.header(watch.revision())),
            watch_id: id,
            created: true,
            ..Default::default()
        };
        if !self.send(created).await {
            return false;
        }

        self.watches.insert(id, watch.cancellation());
        let pump = Pump {
            state: self.state.clone(),
            out: self.out.clone(),
            delivery,
        };
        tokio::spawn(pump.run(watch));
        true
    }

    /// A watch that could not be registered is reported created and
    /// cancelled in one frame.
    async fn reject(&self, req: &proto::WatchCreateRequest, err: StrataError) -> bool {
        tracing::debug!(error = %err, start_revision = req.start_revision, "watch rejected");
        let mut response = proto::WatchResponse {
            header: Some(self.state.header(self.state.hub.cursor())),
            watch_id: req.watch_id,
            created: true,
            canceled: true,
            ..Default::default()
        };
        match err {
            StrataError::RevisionCompacted {
                compact_revision, ..
            } => response.compact_revision = compact_revision,
            other => response.cancel_reason = other.to_string(),
        }
        self.send(response).await
    }

    async fn cancel(&mut self, watch_id: i64) -> bool {
        let Some(token) = self.watches.remove(&watch_id) else {
            return true;
        };
        token.cancel();
        tracing::debug!(watch_id, "watch cancelled by client");

        self.send(proto::WatchResponse {
            header: Some(self.state.header(self.state.hub.cursor())),
            watch_id,
            canceled: true,
            ..Default::default()
        })
        .await
    }

    async fn progress(&self) -> bool {
        let revision = self.state.hub.cursor();
        self.send(proto::WatchResponse {
            header: Some(self.state.header(revision)),
            watch_id: PROGRESS_WATCH_ID,
            ..Default::default()
        })
        .await
    }
}

/// Drains one watch into the stream.
struct Pump {
    state: SharedState,
    out: Outbound,
    delivery: Delivery,
}

impl Pump {
    async fn run(self, mut watch: Watch) {
        let id = watch.id();
        loop {
            let batch = tokio::select! {
                _ = self.out.closed() => break,
                batch = watch.next() => batch,
            };
            let response = match batch {
                None => break,
                Some(Ok(records)) => match self.events(id, &records) {
                    Some(response) => response,
                    None => continue,
                },
                Some(Err(err)) => {
                    let response = self.ended(id, err);
                    let _ = self.out.send(Ok(response)).await;
                    break;
                }
            };
            if self.out.send(Ok(response)).await.is_err() {
                break;
            }
        }
        watch.cancel();
    }

    fn events(&self, id: i64, records: &[Record]) -> Option<proto::WatchResponse> {
        let events: Vec<proto::Event> = records
            .iter()
            .filter_map(|record| self.delivery.event(record))
            .collect();
        let newest = events.last()?.kv.as_ref().map_or(0, |kv| kv.mod_revision);
        Some(proto::WatchResponse {
            header: Some(self.state.header(newest)),
            watch_id: id,
            events,
            ..Default::default()
        })
    }

    fn ended(&self, id: i64, err: StrataError) -> proto::WatchResponse {
        let mut response = proto::WatchResponse {
            header: Some(self.state.header(self.state.hub.cursor())),
            watch_id: id,
            canceled: true,
            ..Default::default()
        };
        match err {
            StrataError::RevisionCompacted {
                compact_revision, ..
            } => {
                response.compact_revision = compact_revision;
            }
            StrataError::WatchLagged { .. } => {
                tracing::warn!(watch_id = id, "watch dropped for lagging");
                response.cancel_reason = WATCH_LAGGED_REASON.to_string();
            }
            other => {
                tracing::warn!(watch_id = id, error = %other, "watch failed");
                response.cancel_reason = other.to_string();
            }
        }
        response
    }
}
