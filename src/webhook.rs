use std::{
    convert::Infallible,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use log::{debug, error, info, warn};
use rustls::{crypto::ring, ServerConfig};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Sleep,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter, Rejection,
};

use crate::{
    metrics::Metrics,
    mutate::{Mutation, Mutator},
    tls::ReloadingCert,
    validate::Validator,
    Error,
};

pub const NOT_A_POD: &str = "Provided resource was not a Pod";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PENDING_CONNECTIONS: usize = 64;

/// The parts of an admission request the engines act on.
#[derive(Debug, Clone)]
pub struct Review {
    pub operation: Operation,
    pub namespace: String,
    pub kind: String,
    pub dry_run: bool,
    /// The old object for DELETE, the submitted one otherwise.
    pub object: DynamicObject,
}

impl Review {
    pub fn from_request(request: &AdmissionRequest<DynamicObject>) -> Option<Self> {
        let object = match &request.operation {
            Operation::Delete => request.old_object.clone(),
            _ => request.object.clone(),
        }?;
        Some(Review {
            operation: request.operation.clone(),
            namespace: request.namespace.clone().unwrap_or_default(),
            kind: request.kind.kind.clone(),
            dry_run: request.dry_run,
            object,
        })
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn is_pod(&self) -> bool {
        self.kind == "Pod"
    }

    pub fn pod(&self) -> Result<Pod, Error> {
        if !self.is_pod() {
            return Err(Error::UserInputError(format!("expected a Pod, got {}", self.kind)));
        }
        Ok(serde_json::from_value(serde_json::to_value(&self.object)?)?)
    }

    #[cfg(test)]
    pub fn for_object<K: serde::Serialize>(
        operation: Operation,
        namespace: &str,
        kind: &str,
        object: &K,
    ) -> Self {
        Review {
            operation,
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            dry_run: false,
            object: serde_json::from_value(serde_json::to_value(object).unwrap()).unwrap(),
        }
    }

    #[cfg(test)]
    pub fn for_pod(operation: Operation, namespace: &str, pod: &Pod) -> Self {
        Self::for_object(operation, namespace, "Pod", pod)
    }
}

/// The two admission engines behind the webhook endpoints.
pub struct Webhooks {
    pub validator: Validator,
    pub mutator: Mutator,
    pub metrics: Metrics,
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

fn with_warnings(mut response: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

fn mutation_response(
    response: AdmissionResponse,
    mutation: Mutation,
) -> Result<AdmissionResponse, Error> {
    let response = match mutation.patch() {
        Some(patch) => response.with_patch(patch)?,
        None => response,
    };
    Ok(with_warnings(response, mutation.warnings))
}

async fn validate_handler(
    body: AdmissionReview<DynamicObject>,
    hooks: Arc<Webhooks>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(&AdmissionResponse::invalid(err).into_review()));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(review) = Review::from_request(&req) {
        res = match hooks.validator.validate(&review).await {
            Ok(warnings) => with_warnings(res, warnings),
            Err(err) => {
                warn!("denied: {:?} on {} ({})", req.operation, review.name(), err);
                res.deny(err.to_string())
            }
        };
    }
    hooks
        .metrics
        .admission_review("validate", operation_name(&req.operation), res.allowed);
    Ok(reply::json(&res.into_review()))
}

async fn mutate_handler(
    body: AdmissionReview<DynamicObject>,
    hooks: Arc<Webhooks>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(&AdmissionResponse::invalid(err).into_review()));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(review) = Review::from_request(&req) {
        let result = match hooks.mutator.mutate(&review).await {
            Ok(mutation) => mutation_response(res.clone(), mutation),
            Err(err) => Err(err),
        };
        res = match result {
            Ok(res) => res,
            Err(err) => {
                warn!("denied: {:?} on {} ({})", req.operation, review.name(), err);
                res.deny(err.to_string())
            }
        };
    }
    hooks
        .metrics
        .admission_review("mutate", operation_name(&req.operation), res.allowed);
    Ok(reply::json(&res.into_review()))
}

async fn metrics_handler(metrics: Metrics) -> Result<impl Reply, Infallible> {
    Ok(match metrics.encode() {
        Ok(text) => reply::with_status(text, StatusCode::OK),
        Err(e) => {
            error!("encoding metrics: {e}");
            reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

pub fn routes(
    hooks: Arc<Webhooks>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let validate_hooks = hooks.clone();
    let validate = warp::path("validate")
        .and(warp::path::end())
        .and(warp::body::json())
        .and(warp::any().map(move || validate_hooks.clone()))
        .and_then(validate_handler);
    let mutate = warp::path("mutate")
        .and(warp::path::end())
        .and(warp::body::json())
        .and(warp::any().map(move || hooks.clone()))
        .and_then(mutate_handler);

    warp::post()
        .and(warp::path("inject"))
        .and(validate.or(mutate))
        .with(warp::log::log("webhook"))
}

/// Serves the admission endpoints over TLS until `token` is cancelled.
pub async fn serve_webhook(
    addr: SocketAddr,
    hooks: Arc<Webhooks>,
    cert: Arc<ReloadingCert>,
    token: CancellationToken,
) -> Result<(), Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(cert);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind(addr).await?;
    info!("webhook listening on {addr}");

    let (sender, connections) = mpsc::channel(PENDING_CONNECTIONS);
    tokio::spawn(accept_connections(listener, acceptor, sender, token.clone()));

    let server = warp::serve(routes(hooks)).serve_incoming_with_graceful_shutdown(
        ReceiverStream::new(connections),
        token.clone().cancelled_owned(),
    );
    drain("webhook", server, &token).await;
    Ok(())
}

/// Completes TLS handshakes off the accept loop so a slow client cannot stall it.
async fn accept_connections(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    connections: mpsc::Sender<Result<TimedStream<TlsStream<TcpStream>>, io::Error>>,
    token: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accepting connection: {e}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let connections = connections.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => {
                    let stream = TimedStream::new(stream, IDLE_TIMEOUT, WRITE_TIMEOUT);
                    let _ = connections.send(Ok(stream)).await;
                }
                Ok(Err(e)) => debug!("TLS handshake with {peer} failed: {e}"),
                Err(_) => debug!("TLS handshake with {peer} timed out"),
            }
        });
    }
    debug!("webhook accept loop stopped");
}

/// Connection that fails once a read or a write makes no progress for too long.
///
/// A pending read covers both a slow request and an idle keep-alive connection.
struct TimedStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        TimedStream {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn poll_expired(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_expired(&mut this.read_deadline, this.read_timeout, cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_expired(&mut this.write_deadline, this.write_timeout, cx).map(Err)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_expired(&mut this.write_deadline, this.write_timeout, cx).map(Err)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Serves `GET /metrics` over plain HTTP until `token` is cancelled.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Metrics,
    token: CancellationToken,
) -> Result<(), Error> {
    let routes = warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and(warp::any().map(move || metrics.clone()))
        .and_then(metrics_handler);

    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, token.clone().cancelled_owned())?;
    info!("metrics listening on {addr}");
    drain("metrics", server, &token).await;
    Ok(())
}

/// Runs a server until shutdown, then gives open connections a bounded time to finish.
async fn drain(name: &str, server: impl Future<Output = ()>, token: &CancellationToken) {
    tokio::pin!(server);
    tokio::select! {
        _ = &mut server => return,
        _ = token.cancelled() => (),
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await.is_err() {
        warn!("{name} server did not drain within {SHUTDOWN_TIMEOUT:?}, closing");
    }
    info!("{name} server stopped");
}
