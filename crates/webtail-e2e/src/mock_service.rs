//! Mock upstream HTTP service.
//!
//! Listens on a local port, records every request for assertions, and
//! returns a configurable response. Plays the role of the backend a
//! proxy instance forwards to.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response_status: Arc<RwLock<StatusCode>>,
    response_body: Arc<RwLock<Vec<u8>>>,
}

impl MockHttpService {
    /// Start a mock service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let response_status = Arc::new(RwLock::new(StatusCode::OK));
        let response_body: Arc<RwLock<Vec<u8>>> = Arc::new(RwLock::new(b"OK".to_vec()));

        let requests_clone = requests.clone();
        let status_clone = response_status.clone();
        let body_clone = response_body.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let requests = requests_clone.clone();
                let status = status_clone.clone();
                let body = body_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let status = status.clone();
                        let body = body.clone();
                        async move { record_and_respond(req, requests, status, body).await }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            response_status,
            response_body,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_response_status(&self, status: StatusCode) {
        *self.response_status.write() = status;
    }

    pub fn set_response_body(&self, body: Vec<u8>) {
        *self.response_body.write() = body;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }
}

async fn record_and_respond(
    req: Request<Incoming>,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    status: Arc<RwLock<StatusCode>>,
    body: Arc<RwLock<Vec<u8>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let req_body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => Vec::new(),
    };

    requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body: req_body,
    });

    let mut response = Response::new(Full::new(Bytes::from(body.read().clone())));
    *response.status_mut() = *status.read();
    Ok(response)
}
