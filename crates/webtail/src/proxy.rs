//! One proxy instance per service: a tailnet node, a TLS listener, a
//! serving loop, and a forwarder.
//!
//! Instances share nothing mutable with each other; the only shared
//! object is the read-only [`TailnetSettings`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use webtail_tailnet::{NodeListener, NodeSession, NodeStream, TailnetBackend, TailnetError};

use crate::config::{ServiceSpec, TailnetSettings};
use crate::forwarder::{ForwardError, RequestForwarder};

/// How long one instance may take to wind down before it is abandoned.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Port the tailnet listener is requested on.
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("tailnet bringup failed for '{node}': {source}")]
    Bringup {
        node: String,
        #[source]
        source: TailnetError,
    },

    #[error("failed to create listener for '{node}': {source}")]
    Listener {
        node: String,
        #[source]
        source: TailnetError,
    },

    #[error("no TLS-certified domains reported for '{node}'")]
    NoDomain { node: String },
}

#[derive(Debug, Clone, Error)]
pub enum StopError {
    #[error("timeout stopping proxy for '{node}'")]
    Timeout { node: String },
}

/// A single service proxy bound to one tailnet node.
pub struct ProxyInstance {
    spec: ServiceSpec,
    settings: Arc<TailnetSettings>,
    backend: Arc<dyn TailnetBackend>,
    session: Mutex<Option<Box<dyn NodeSession>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    stop_done: CancellationToken,
    stop_result: Mutex<Option<Result<(), StopError>>>,
    stop_timeout: Duration,
}

impl ProxyInstance {
    pub fn new(
        spec: ServiceSpec,
        settings: Arc<TailnetSettings>,
        backend: Arc<dyn TailnetBackend>,
    ) -> Arc<Self> {
        Self::with_stop_timeout(spec, settings, backend, DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(
        spec: ServiceSpec,
        settings: Arc<TailnetSettings>,
        backend: Arc<dyn TailnetBackend>,
        stop_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            settings,
            backend,
            session: Mutex::new(None),
            serve_task: Mutex::new(None),
            listen_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            stop_done: CancellationToken::new(),
            stop_result: Mutex::new(None),
            stop_timeout,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    /// Where the node listener actually bound, once running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Bring the node online, bind its TLS listener, and launch the
    /// serving loop. On any failure, everything acquired so far is
    /// released before the error returns.
    pub async fn start(&self) -> Result<(), StartError> {
        let node = self.spec.node_name.clone();

        let session = self
            .backend
            .bring_up(&node, &self.settings.auth_key, self.settings.ephemeral)
            .await
            .map_err(|source| StartError::Bringup {
                node: node.clone(),
                source,
            })?;

        let listener = match session.listen_tls(HTTPS_PORT).await {
            Ok(listener) => listener,
            Err(source) => {
                session.close().await;
                return Err(StartError::Listener { node, source });
            }
        };

        let domains = session.certified_domains();
        if self.spec.trust_forward_header && domains.is_empty() {
            session.close().await;
            return Err(StartError::NoDomain { node });
        }
        let canonical_host = domains.into_iter().next().unwrap_or_else(|| node.clone());

        if let Ok(addr) = listener.local_addr() {
            *self.listen_addr.lock() = Some(addr);
        }

        let forwarder = Arc::new(RequestForwarder::new(&self.spec, canonical_host));

        tracing::info!(
            node = %node,
            target = %self.spec.target_str(),
            "starting proxy"
        );

        let handle = tokio::spawn(serve_loop(
            listener,
            forwarder,
            self.cancel.clone(),
            node,
        ));

        *self.session.lock() = Some(session);
        *self.serve_task.lock() = Some(handle);

        Ok(())
    }

    /// Signal the instance to end serving and wait for the serving task
    /// to exit, bounded by the stop timeout. Idempotent: concurrent and
    /// repeated calls release resources at most once, and all callers
    /// report the same outcome once the wind-down has resolved.
    pub async fn stop(&self) -> Result<(), StopError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            // Another caller owns the shutdown; wait for it to finish
            // and report its result.
            self.stop_done.cancelled().await;
            return self.stop_result.lock().clone().unwrap_or(Ok(()));
        }

        self.cancel.cancel();

        let session = self.session.lock().take();
        let handle = self.serve_task.lock().take();

        let wind_down = async {
            if let Some(session) = session {
                session.close().await;
            }
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        };

        let result = match tokio::time::timeout(self.stop_timeout, wind_down).await {
            Ok(()) => {
                tracing::info!(node = %self.spec.node_name, "proxy stopped");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(node = %self.spec.node_name, "timeout waiting for proxy to stop");
                Err(StopError::Timeout {
                    node: self.spec.node_name.clone(),
                })
            }
        };

        *self.stop_result.lock() = Some(result.clone());
        self.stop_done.cancel();
        result
    }
}

/// Accept loop: parked on the cancellation token, one task per
/// connection. Dropping the listener on exit closes the socket.
async fn serve_loop(
    listener: Box<dyn NodeListener>,
    forwarder: Arc<RequestForwarder>,
    cancel: CancellationToken,
    node: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let forwarder = forwarder.clone();
                        let node = node.clone();
                        tokio::spawn(serve_connection(stream, peer, forwarder, node));
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tracing::warn!(node = %node, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    tracing::debug!(node = %node, "serving loop exited");
}

async fn serve_connection(
    stream: Box<dyn NodeStream>,
    peer: SocketAddr,
    forwarder: Arc<RequestForwarder>,
    node: String,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let forwarder = forwarder.clone();
        let node = node.clone();
        async move { handle_request(req, forwarder, node).await }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!(%peer, error = %e, "connection error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    forwarder: Arc<RequestForwarder>,
    node: String,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match forwarder.forward(req).await {
        Ok(response) => Ok(response),
        Err(ForwardError::Rewrite(e)) => {
            tracing::error!(node = %node, error = %e, "request rewrite failed");
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid target URL",
            ))
        }
        Err(e) => {
            tracing::error!(node = %node, error = %e, "upstream request failed");
            Ok(text_response(StatusCode::BAD_GATEWAY, "Upstream request failed"))
        }
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}
