//! gRPC server for the etcd v3 API.
//!
//! The etcd services are routed by hand rather than through generated
//! server stubs: each wrapper matches the request path and hands the body
//! to tonic's [`Grpc`](tonic::server::Grpc) with a prost codec for the
//! method's message types.

use super::cluster::{self, ClusterService};
use super::errors::to_status;
use super::kv::KvService;
use super::lease::{self, LeaseService};
use super::maintenance::MaintenanceService;
use super::proto;
use super::watch::WatchService;
use crate::core::config::ListenerConfig;
use crate::core::error::{StrataError, StrataResult};
use crate::mvcc::Backend;
use crate::net::{BoundListener, TlsIdentity};
use crate::watch::WatchHub;
use std::convert::Infallible;
use std::future::Future;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, StdError};
use tonic::server::{Grpc, NamedService, StreamingService, UnaryService};
use tonic::transport::Server;
use tonic::Status;

/// Shared state for the gRPC services.
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Key-value engine.
    pub backend: Backend,
    /// Watch registry.
    pub hub: WatchHub,
    /// Cluster ID for response headers.
    pub cluster_id: u64,
    /// Member ID for response headers.
    pub member_id: u64,
    /// Member name reported by MemberList.
    pub member_name: String,
    /// Client URL reported by MemberList.
    pub client_url: String,
    /// Shutdown signal receiver.
    pub shutdown_rx: watch::Receiver<bool>,
}

impl SharedState {
    /// Create a new shared state.
    pub fn new(
        backend: Backend,
        hub: WatchHub,
        listener: &ListenerConfig,
        client_url: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            hub,
            cluster_id: listener.cluster_id,
            member_id: listener.member_id,
            member_name: listener.member_name.clone(),
            client_url,
            shutdown_rx,
        }
    }

    /// Response header stamped with `revision`.
    pub fn header(&self, revision: i64) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision,
            raft_term: 1,
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// gRPC server for the etcd v3 API.
pub struct EtcdGrpcServer {
    listener: BoundListener,
    tls: Option<TlsIdentity>,
    state: SharedState,
}

impl EtcdGrpcServer {
    /// Create a server on an already bound listener.
    pub fn new(listener: BoundListener, tls: Option<TlsIdentity>, state: SharedState) -> Self {
        Self {
            listener,
            tls,
            state,
        }
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Serve until the shutdown signal fires.
    pub async fn run(self) -> StrataResult<()> {
        let mut builder = configure_tls(Server::builder(), self.tls.as_ref())?;
        let state = self.state;
        let router = builder
            .add_service(EtcdKvServer::new(KvService::new(state.clone())))
            .add_service(EtcdWatchServer::new(WatchService::new(state.clone())))
            .add_service(EtcdLeaseServer::new(LeaseService::new(state.clone())))
            .add_service(EtcdClusterServer::new(ClusterService::new(state.clone())))
            .add_service(EtcdMaintenanceServer::new(MaintenanceService::new(
                state.clone(),
            )));

        let mut shutdown_rx = state.shutdown_rx.clone();
        let signal = async move {
            shutdown_signalled(&mut shutdown_rx).await;
            tracing::info!("gRPC server shutting down");
        };

        let served = match self.listener {
            BoundListener::Tcp {
                listener,
                local_addr,
            } => {
                tracing::info!(%local_addr, client_url = %state.client_url, "serving etcd API");
                router
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                    .await
            }
            #[cfg(unix)]
            BoundListener::Unix { listener, path } => {
                tracing::info!(path = %path.display(), "serving etcd API");
                router
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::UnixListenerStream::new(listener),
                        signal,
                    )
                    .await
            }
        };
        served.map_err(|e| StrataError::internal(format!("gRPC server error: {e}")))
    }
}

#[cfg(feature = "tls")]
fn configure_tls(builder: Server, tls: Option<&TlsIdentity>) -> StrataResult<Server> {
    use tonic::transport::{Identity, ServerTlsConfig};

    let Some(tls) = tls else {
        return Ok(builder);
    };
    let identity = Identity::from_pem(&tls.cert_pem, &tls.key_pem);
    builder
        .tls_config(ServerTlsConfig::new().identity(identity))
        .map_err(|e| StrataError::internal(format!("invalid TLS configuration: {e}")))
}

#[cfg(not(feature = "tls"))]
fn configure_tls(builder: Server, tls: Option<&TlsIdentity>) -> StrataResult<Server> {
    match tls {
        Some(_) => Err(StrataError::unsupported("TLS in a build without the tls feature")),
        None => Ok(builder),
    }
}

// ============================================================================
// Method plumbing
// ============================================================================

/// Adapts an async handler to tonic's unary service.
struct Unary<F>(F);

impl<Req, Resp, F, Fut> UnaryService<Req> for Unary<F>
where
    Resp: Send + 'static,
    F: FnMut(Req) -> Fut,
    Fut: Future<Output = StrataResult<Resp>> + Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<tonic::Response<Resp>, Status>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        let fut = (self.0)(request.into_inner());
        Box::pin(async move {
            fut.await.map(tonic::Response::new).map_err(|err| {
                if err.is_compare_outcome() {
                    tracing::trace!(error = %err, "request failed");
                } else {
                    tracing::debug!(error = %err, "request failed");
                }
                to_status(&err)
            })
        })
    }
}

/// Decode, dispatch and encode one unary call.
async fn unary<B, Req, Resp, F, Fut>(req: http::Request<B>, handler: F) -> http::Response<BoxBody>
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    F: FnMut(Req) -> Fut + Send + 'static,
    Fut: Future<Output = StrataResult<Resp>> + Send + 'static,
{
    let mut grpc = Grpc::new(ProstCodec::<Resp, Req>::default());
    grpc.unary(Unary(handler), req).await
}

/// Answer a method this server does not implement.
fn reject_method(path: &str, unsupported: &[&str]) -> BoxFuture<http::Response<BoxBody>, Infallible> {
    let method = path.rsplit('/').next().unwrap_or(path);
    let status = if unsupported.contains(&method) {
        tracing::debug!(method, "unsupported method called");
        to_status(&StrataError::unsupported(method))
    } else {
        tracing::warn!(path, "unknown method called");
        Status::unimplemented(format!("unknown method {path}"))
    };
    let response = status.into_http();
    Box::pin(async move { Ok(response) })
}

// ============================================================================
// Tonic Service Wrappers
// ============================================================================

/// etcdserverpb.KV
#[derive(Clone)]
pub struct EtcdKvServer {
    inner: KvService,
}

impl EtcdKvServer {
    pub fn new(inner: KvService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdKvServer {
    const NAME: &'static str = "etcdserverpb.KV";
}

impl<B> tonic::codegen::Service<http::Request<B>> for EtcdKvServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let kv = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.KV/Range" => Box::pin(async move {
                Ok(unary(req, move |r: proto::RangeRequest| {
                    let kv = kv.clone();
                    async move { kv.range(r).await }
                })
                .await)
            }),
            "/etcdserverpb.KV/Put" => Box::pin(async move {
                Ok(unary(req, move |r: proto::PutRequest| {
                    let kv = kv.clone();
                    async move { kv.put(r).await }
                })
                .await)
            }),
            "/etcdserverpb.KV/DeleteRange" => Box::pin(async move {
                Ok(unary(req, move |r: proto::DeleteRangeRequest| {
                    let kv = kv.clone();
                    async move { kv.delete_range(r).await }
                })
                .await)
            }),
            "/etcdserverpb.KV/Txn" => Box::pin(async move {
                Ok(unary(req, move |r: proto::TxnRequest| {
                    let kv = kv.clone();
                    async move { kv.txn(r).await }
                })
                .await)
            }),
            "/etcdserverpb.KV/Compact" => Box::pin(async move {
                Ok(unary(req, move |r: proto::CompactionRequest| {
                    let kv = kv.clone();
                    async move { kv.compact(r).await }
                })
                .await)
            }),
            other => reject_method(other, &[]),
        }
    }
}

/// Bidirectional Watch stream.
struct WatchStream(WatchService);

impl StreamingService<proto::WatchRequest> for WatchStream {
    type Response = proto::WatchResponse;
    type ResponseStream = ReceiverStream<Result<proto::WatchResponse, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(
        &mut self,
        request: tonic::Request<tonic::Streaming<proto::WatchRequest>>,
    ) -> Self::Future {
        let responses = self.0.open(request.into_inner());
        Box::pin(async move { Ok(tonic::Response::new(responses)) })
    }
}

/// etcdserverpb.Watch
#[derive(Clone)]
pub struct EtcdWatchServer {
    inner: WatchService,
}

impl EtcdWatchServer {
    pub fn new(inner: WatchService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdWatchServer {
    const NAME: &'static str = "etcdserverpb.Watch";
}

impl<B> tonic::codegen::Service<http::Request<B>> for EtcdWatchServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Watch/Watch" => Box::pin(async move {
                let mut grpc =
                    Grpc::new(ProstCodec::<proto::WatchResponse, proto::WatchRequest>::default());
                Ok(grpc.streaming(WatchStream(service), req).await)
            }),
            other => reject_method(other, &[]),
        }
    }
}

/// etcdserverpb.Lease
#[derive(Clone)]
pub struct EtcdLeaseServer {
    inner: LeaseService,
}

impl EtcdLeaseServer {
    pub fn new(inner: LeaseService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdLeaseServer {
    const NAME: &'static str = "etcdserverpb.Lease";
}

impl<B> tonic::codegen::Service<http::Request<B>> for EtcdLeaseServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let lease = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Lease/LeaseGrant" => Box::pin(async move {
                Ok(unary(req, move |r: proto::LeaseGrantRequest| {
                    let lease = lease.clone();
                    async move { lease.grant(r).await }
                })
                .await)
            }),
            other => reject_method(other, lease::UNSUPPORTED_METHODS),
        }
    }
}

/// etcdserverpb.Cluster
#[derive(Clone)]
pub struct EtcdClusterServer {
    inner: ClusterService,
}

impl EtcdClusterServer {
    pub fn new(inner: ClusterService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdClusterServer {
    const NAME: &'static str = "etcdserverpb.Cluster";
}

impl<B> tonic::codegen::Service<http::Request<B>> for EtcdClusterServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let cluster = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Cluster/MemberList" => Box::pin(async move {
                Ok(unary(req, move |r: proto::MemberListRequest| {
                    let cluster = cluster.clone();
                    async move { cluster.member_list(r).await }
                })
                .await)
            }),
            other => reject_method(other, cluster::UNSUPPORTED_METHODS),
        }
    }
}

/// etcdserverpb.Maintenance
#[derive(Clone)]
pub struct EtcdMaintenanceServer {
    inner: MaintenanceService,
}

impl EtcdMaintenanceServer {
    pub fn new(inner: MaintenanceService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdMaintenanceServer {
    const NAME: &'static str = "etcdserverpb.Maintenance";
}

impl<B> tonic::codegen::Service<http::Request<B>> for EtcdMaintenanceServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let maintenance = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Maintenance/Status" => Box::pin(async move {
                Ok(unary(req, move |r: proto::StatusRequest| {
                    let maintenance = maintenance.clone();
                    async move { maintenance.status(r).await }
                })
                .await)
            }),
            other => reject_method(other, &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signalled() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_signalled(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signalled_on_sender_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_signalled(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsupported_lease_method() {
        let response = reject_method("/etcdserverpb.Lease/LeaseRevoke", lease::UNSUPPORTED_METHODS)
            .await
            .unwrap();
        let status = response.headers().get("grpc-status").unwrap();
        assert_eq!(status, &(tonic::Code::Unimplemented as i32).to_string());
    }
}
