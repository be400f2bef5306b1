//! Mock HTTP service for E2E tests
//!
//! Plays the local service a tunnel client exposes: it records every request
//! it receives and answers with a configurable response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

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
    /// Path and query as received
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct CannedResponse {
    status: StatusCode,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    delay: Option<Duration>,
}

impl Default for CannedResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            body: b"OK".to_vec(),
            headers: Vec::new(),
            delay: None,
        }
    }
}

/// A mock HTTP service for testing
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response: Arc<RwLock<CannedResponse>>,
}

impl MockHttpService {
    /// Start a mock HTTP service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let response = Arc::new(RwLock::new(CannedResponse::default()));

        let requests_clone = requests.clone();
        let response_clone = response.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let requests = requests_clone.clone();
                let response = response_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let response = response.clone();
                        async move {
                            let recorded = record(req).await;
                            requests.write().push(recorded);

                            let canned = response.read().clone();
                            if let Some(delay) = canned.delay {
                                tokio::time::sleep(delay).await;
                            }

                            let mut builder = Response::builder().status(canned.status);
                            for (name, value) in canned.headers {
                                builder = builder.header(name, value);
                            }
                            Ok::<_, Infallible>(
                                builder.body(Full::new(Bytes::from(canned.body))).unwrap(),
                            )
                        }
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
            response,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all recorded requests
    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.read().last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.response.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.response.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response
            .write()
            .headers
            .push((name.into(), value.into()));
    }

    /// Hold every response back for `delay` after the request is read
    pub fn set_response_delay(&self, delay: Duration) {
        self.response.write().delay = Some(delay);
    }
}

async fn record(req: Request<Incoming>) -> RecordedRequest {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    RecordedRequest {
        method,
        uri,
        headers,
        body,
    }
}
