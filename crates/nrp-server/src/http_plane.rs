use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame as BodyFrame, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use nrp_protocol::{
    decode_ws_message, encode_ws_message, is_hop_by_hop, Frame, FrameFlag, FrameType, HeaderList,
    ProtocolRevision, RequestHead, ResponseHead, MAX_PAYLOAD_LEN,
};

use crate::registry::ClientRegistry;
use crate::session::{ExchangeGuard, ExchangeKind, TunnelSession};

pub type EdgeBody = UnsyncBoxBody<Bytes, io::Error>;

/// Public HTTP/WebSocket listener that forwards traffic into tunnels
pub struct HttpPlane {
    registry: Arc<ClientRegistry>,
    response_timeout: Duration,
}

impl HttpPlane {
    pub fn new(registry: Arc<ClientRegistry>, response_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            response_timeout,
        })
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    /// Start listening for public HTTP traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve public HTTP traffic on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("HTTP connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                this.serve_connection(stream, peer_addr).await;
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<EdgeBody>, Infallible> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(HOST)
        );

        let Some(host) = request_host(&req) else {
            tracing::warn!("Request without Host header");
            return Ok(text_response(StatusCode::BAD_REQUEST, "need host"));
        };

        let Some(session) = self.registry.resolve(&host) else {
            tracing::debug!("No tunnel for host: {}", host);
            return Ok(text_response(StatusCode::NOT_FOUND, "host not found"));
        };

        if is_websocket_request(&req) {
            Ok(handle_websocket(session, host, req))
        } else {
            Ok(self.handle_http(session, host, req).await)
        }
    }

    async fn handle_http(
        &self,
        session: Arc<TunnelSession>,
        host: String,
        req: Request<Incoming>,
    ) -> Response<EdgeBody> {
        let (stream_id, mut frames) = session.open_exchange(ExchangeKind::Http);
        let mut guard = ExchangeGuard::new(session.clone(), stream_id);

        let head = RequestHead {
            method: Some(req.method().to_string()),
            path: request_path(&req),
            host: Some(host),
            headers: header_list(req.headers()),
        };
        if let Err(e) = send_head(&session, FrameType::Headers, stream_id, &head) {
            tracing::warn!("Failed to open stream {}: {}", stream_id, e);
            guard.finish();
            return text_response(StatusCode::BAD_GATEWAY, "tunnel closed");
        }
        tracing::debug!("Stream {}: {} {}", stream_id, req.method(), head.path);

        tokio::spawn(pump_request_body(session, stream_id, req.into_body()));

        let first = match tokio::time::timeout(self.response_timeout, frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::warn!("Tunnel closed before response on stream {}", stream_id);
                guard.finish();
                return text_response(StatusCode::BAD_GATEWAY, "tunnel closed");
            }
            Err(_) => {
                tracing::warn!("Timeout waiting for response on stream {}", stream_id);
                return text_response(StatusCode::GATEWAY_TIMEOUT, "tunnel response timeout");
            }
        };

        if first.kind() == FrameType::RstStream {
            guard.finish();
            return text_response(StatusCode::BAD_GATEWAY, "stream reset");
        }

        if first.is_data() {
            // The relay could not route the request; its reason is the body
            tracing::debug!(
                "Stream {} answered without headers: {}",
                stream_id,
                String::from_utf8_lossy(first.payload())
            );
            if first.is_data_end() {
                guard.finish();
            }
            return bytes_response(StatusCode::BAD_GATEWAY, first.into_payload());
        }

        let head: ResponseHead = match first.json() {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!("Invalid response head on stream {}: {}", stream_id, e);
                return text_response(StatusCode::BAD_GATEWAY, "invalid response head");
            }
        };

        let mut response = Response::new(
            TunnelBody {
                frames,
                guard,
                done: false,
            }
            .boxed_unsync(),
        );
        *response.status_mut() =
            StatusCode::from_u16(head.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
        copy_headers(&head.headers, response.headers_mut());
        response
    }
}

/// Response body fed by the DATA frames of one stream
struct TunnelBody {
    frames: mpsc::UnboundedReceiver<Frame>,
    guard: ExchangeGuard,
    done: bool,
}

impl Body for TunnelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BodyFrame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            let frame = match this.frames.poll_recv(cx) {
                Poll::Ready(frame) => frame,
                Poll::Pending => return Poll::Pending,
            };

            match frame {
                Some(frame) if frame.kind() == FrameType::RstStream => {
                    this.done = true;
                    this.guard.finish();
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset by relay",
                    ))));
                }
                Some(frame) if frame.is_data_end() => {
                    this.done = true;
                    this.guard.finish();
                    return Poll::Ready(None);
                }
                Some(frame) if frame.is_data() => {
                    if frame.payload().is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(BodyFrame::data(frame.into_payload()))));
                }
                Some(frame) => {
                    tracing::debug!(
                        "Unexpected {:?} frame in body of stream {}",
                        frame.kind(),
                        frame.stream_id()
                    );
                }
                None => {
                    this.done = true;
                    this.guard.finish();
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "tunnel closed",
                    ))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

/// Forward the public request body as DATA frames, then the terminator
async fn pump_request_body(session: Arc<TunnelSession>, stream_id: u32, mut body: Incoming) {
    while let Some(next) = body.frame().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Request body of stream {} failed: {}", stream_id, e);
                return;
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_PAYLOAD_LEN).min(data.len());
            if session.send(Frame::data(stream_id, data.slice(offset..end))).is_err() {
                return;
            }
            offset = end;
        }
    }

    let _ = session.send(Frame::end_data(FrameType::Data, stream_id));
}

/// Accept a public WebSocket upgrade and bridge it to a tunnel stream
///
/// The upgrade is answered right away; messages the public side sends before
/// the relay reached the local service are queued in the tunnel.
fn handle_websocket(
    session: Arc<TunnelSession>,
    host: String,
    mut req: Request<Incoming>,
) -> Response<EdgeBody> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return text_response(StatusCode::BAD_REQUEST, "missing sec-websocket-key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let protocol = first_subprotocol(req.headers());

    let revision = session.revision();
    let (stream_id, frames) = session.open_exchange(ExchangeKind::WebSocket);
    let mut guard = ExchangeGuard::new(session.clone(), stream_id);

    let head = RequestHead {
        method: None,
        path: request_path(&req),
        host: Some(host),
        headers: header_list(req.headers()),
    };
    if let Err(e) = send_head(&session, FrameType::ws_headers(revision), stream_id, &head) {
        tracing::warn!("Failed to open websocket stream {}: {}", stream_id, e);
        guard.finish();
        return text_response(StatusCode::BAD_GATEWAY, "tunnel closed");
    }
    tracing::debug!("Stream {}: websocket {}", stream_id, head.path);

    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                bridge_websocket(ws, frames, guard, revision).await;
            }
            Err(e) => {
                tracing::warn!("Websocket upgrade failed on stream {}: {}", stream_id, e);
            }
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    if let Some(value) = protocol.and_then(|p| HeaderValue::from_str(&p).ok()) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    response
}

/// Shuttle messages between the public socket and the tunnel stream
async fn bridge_websocket<S>(
    ws: WebSocketStream<S>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut guard: ExchangeGuard,
    revision: ProtocolRevision,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream_id = guard.stream_id();
    let session = guard.session().clone();
    let data_kind = FrameType::ws_data(revision);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            message = source.next() => {
                let payload = match message {
                    Some(Ok(Message::Text(text))) => encode_ws_message(false, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => encode_ws_message(true, &data),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Public websocket closed on stream {}", stream_id);
                        let _ = session.send(Frame::end_data(data_kind, stream_id));
                        let _ = sink.close().await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("Public websocket error on stream {}: {}", stream_id, e);
                        let _ = session.send(Frame::end_data(data_kind, stream_id));
                        break;
                    }
                };
                if session
                    .send(Frame::new(data_kind, FrameFlag::Padded, stream_id, payload))
                    .is_err()
                {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(frame) if frame.is_data_end() || frame.kind() == FrameType::RstStream => {
                        tracing::debug!("Relay closed websocket on stream {}", stream_id);
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(frame) if frame.is_data() => {
                        let (binary, body) = decode_ws_message(frame.payload());
                        let message = if binary {
                            Message::binary(body)
                        } else {
                            Message::text(String::from_utf8_lossy(&body).into_owned())
                        };
                        if let Err(e) = sink.send(message).await {
                            tracing::debug!("Public websocket write failed on stream {}: {}", stream_id, e);
                            let _ = session.send(Frame::end_data(data_kind, stream_id));
                            break;
                        }
                    }
                    Some(frame) => {
                        tracing::trace!("Ignoring {:?} frame on websocket stream {}", frame.kind(), stream_id);
                    }
                    None => {
                        tracing::debug!("Tunnel closed under websocket stream {}", stream_id);
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    guard.finish();
}

fn send_head(
    session: &TunnelSession,
    kind: FrameType,
    stream_id: u32,
    head: &RequestHead,
) -> Result<()> {
    let payload = serde_json::to_vec(head)?;
    session.send(Frame::headers(kind, stream_id, payload))?;
    Ok(())
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;
    let host = host.trim();
    (!host.is_empty()).then(|| host.to_string())
}

fn request_path(req: &Request<Incoming>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn header_list(headers: &hyper::HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn is_websocket_request<B>(req: &Request<B>) -> bool {
    header_list(req.headers()).is_websocket_upgrade()
}

fn first_subprotocol(headers: &hyper::HeaderMap) -> Option<String> {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_string)
}

/// Copy relayed response headers, leaving out hop-by-hop ones
fn copy_headers(from: &HeaderList, to: &mut hyper::HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                to.append(name, value);
            }
            _ => tracing::debug!("Dropping invalid response header {:?}", name),
        }
    }
}

fn empty_body() -> EdgeBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn bytes_response(status: StatusCode, body: Bytes) -> Response<EdgeBody> {
    let mut response = Response::new(
        Full::new(body)
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, message: &'static str) -> Response<EdgeBody> {
    bytes_response(status, Bytes::from_static(message.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_request_detection() {
        let req = Request::builder()
            .header("Upgrade", "websocket")
            .header("Connection", "keep-alive, Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert!(is_websocket_request(&req));

        let plain = Request::builder()
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_websocket_request(&plain));
    }

    #[test]
    fn test_first_subprotocol() {
        let mut headers = hyper::HeaderMap::new();
        assert_eq!(first_subprotocol(&headers), None);

        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(" chat , superchat"));
        assert_eq!(first_subprotocol(&headers).as_deref(), Some("chat"));
    }

    #[test]
    fn test_copy_headers_drops_hop_by_hop() {
        let mut relayed = HeaderList::new();
        relayed.push("content-type", "text/plain");
        relayed.push("transfer-encoding", "chunked");
        relayed.push("connection", "close");
        relayed.push("set-cookie", "a=1");
        relayed.push("set-cookie", "b=2");

        let mut headers = hyper::HeaderMap::new();
        copy_headers(&relayed, &mut headers);

        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[tokio::test]
    async fn test_tunnel_body_streams_until_end_data() {
        let (tx, _outbound) = mpsc::unbounded_channel();
        let session = TunnelSession::new("127.0.0.1:9".parse().unwrap(), tx);
        let (id, frames) = session.open_exchange(ExchangeKind::Http);

        session.route(&Frame::data(id, "hello ")).unwrap();
        session.route(&Frame::data(id, "world")).unwrap();
        session.route(&Frame::end_data(FrameType::Data, id)).unwrap();

        let body = TunnelBody {
            frames,
            guard: ExchangeGuard::new(session.clone(), id),
            done: false,
        };
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"hello world");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_tunnel_body_resets_stream() {
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let session = TunnelSession::new("127.0.0.1:9".parse().unwrap(), tx);
        let (id, frames) = session.open_exchange(ExchangeKind::Http);

        drop(TunnelBody {
            frames,
            guard: ExchangeGuard::new(session.clone(), id),
            done: false,
        });

        let reset = outbound.recv().await.unwrap();
        assert_eq!(reset.kind(), FrameType::RstStream);
        assert_eq!(reset.stream_id(), id);
    }
}
