use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use nrp_protocol::{
    is_hop_by_hop, ClientSettings, Frame, FrameType, HandlerError, HeaderList, ProtocolRevision,
    RequestHead, ResponseHead, MAX_PAYLOAD_LEN,
};

use crate::ws_forwarder;

/// Address every local service is reached on
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Public domain -> local port, built once from the client settings
#[derive(Debug, Clone, Default)]
pub struct HostMap {
    domains: HashMap<String, u16>,
    /// Subdomain labels, used when the settings carry no `subdomain_host`
    subdomains: HashMap<String, u16>,
}

impl HostMap {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let domains = settings.domains(None).into_iter().collect();
        let subdomains = if settings.subdomain_host.is_none() {
            settings
                .http
                .values()
                .map(|s| (s.subdomain.to_ascii_lowercase(), s.local_port))
                .collect()
        } else {
            HashMap::new()
        };
        Self {
            domains,
            subdomains,
        }
    }

    /// Local port for a `host` value: exact match first, then without the port
    pub fn resolve(&self, host: &str) -> Option<u16> {
        let host = host.trim().to_ascii_lowercase();
        if let Some(port) = self.domains.get(&host) {
            return Some(*port);
        }

        let bare = host.rsplit_once(':').map(|(name, _)| name).unwrap_or(&host);
        if let Some(port) = self.domains.get(bare) {
            return Some(*port);
        }

        let label = bare.split('.').next()?;
        self.subdomains.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.domains.len() + self.subdomains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Http,
    WebSocket,
}

/// A local exchange fed by frames from the tunnel
struct LocalExchange {
    kind: ExchangeKind,
    sender: mpsc::UnboundedSender<Frame>,
    task: Option<AbortHandle>,
}

/// Replays tunnel streams against local services
///
/// One relay exists per tunnel connection; its exchanges die with it.
pub struct LocalRelay {
    hosts: HostMap,
    client: reqwest::Client,
    outbound: mpsc::UnboundedSender<Frame>,
    revision: ProtocolRevision,
    exchanges: DashMap<u32, LocalExchange>,
}

impl LocalRelay {
    pub fn new(
        hosts: HostMap,
        client: reqwest::Client,
        outbound: mpsc::UnboundedSender<Frame>,
        revision: ProtocolRevision,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            client,
            outbound,
            revision,
            exchanges: DashMap::new(),
        })
    }

    /// HTTP client for local requests; redirects are left to the public caller
    pub fn http_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    pub fn active_exchanges(&self) -> usize {
        self.exchanges.len()
    }

    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    fn reply_error(&self, stream_id: u32, message: &str) {
        tracing::debug!("Stream {}: {}", stream_id, message);
        self.send(Frame::error(stream_id, message));
    }

    pub(crate) fn finish(&self, stream_id: u32) {
        self.exchanges.remove(&stream_id);
    }

    /// Start a local exchange for a HEADERS (or WS_HEADERS) frame
    pub fn open(self: &Arc<Self>, frame: &Frame) -> Result<(), HandlerError> {
        let stream_id = frame.stream_id();

        let head: RequestHead = match frame.json() {
            Ok(head) => head,
            Err(source) => {
                self.reply_error(stream_id, "invalid headers");
                return Err(HandlerError::Payload { stream_id, source });
            }
        };

        let Some(host) = head.host.as_deref().filter(|h| !h.trim().is_empty()) else {
            self.reply_error(stream_id, "need host");
            return Ok(());
        };

        let Some(port) = self.hosts.resolve(host) else {
            self.reply_error(stream_id, "host not found");
            return Ok(());
        };

        if self.exchanges.contains_key(&stream_id) {
            return Err(HandlerError::Other(format!(
                "Stream {} already has a local exchange",
                stream_id
            )));
        }

        let kind = match self.revision {
            ProtocolRevision::Extended if frame.kind() == FrameType::WsHeaders => {
                ExchangeKind::WebSocket
            }
            ProtocolRevision::Extended => ExchangeKind::Http,
            // Legacy streams share HEADERS; only a complete upgrade request is a socket
            ProtocolRevision::Legacy if head.headers.is_websocket_upgrade() => {
                ExchangeKind::WebSocket
            }
            ProtocolRevision::Legacy => ExchangeKind::Http,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        self.exchanges.insert(
            stream_id,
            LocalExchange {
                kind,
                sender,
                task: None,
            },
        );

        let relay = self.clone();
        let task = match kind {
            ExchangeKind::Http => {
                tokio::spawn(async move { relay.forward_http(stream_id, port, head, receiver).await })
            }
            ExchangeKind::WebSocket => tokio::spawn(async move {
                ws_forwarder::forward(relay, stream_id, port, head, receiver).await
            }),
        };

        if let Some(mut exchange) = self.exchanges.get_mut(&stream_id) {
            exchange.task = Some(task.abort_handle());
        }
        Ok(())
    }

    /// Hand a DATA (or WS_DATA) frame to its local exchange
    pub fn deliver(&self, frame: &Frame) -> Result<(), HandlerError> {
        let stream_id = frame.stream_id();

        if let Some(exchange) = self.exchanges.get(&stream_id) {
            if exchange.sender.send(frame.clone()).is_err() {
                tracing::debug!("Local exchange {} already finished", stream_id);
            }
            return Ok(());
        }

        // Terminators for unknown streams are dropped so closes cannot ping-pong
        if frame.is_data_end() {
            if !frame.payload().is_empty() {
                tracing::warn!(
                    "Server reported on stream {}: {}",
                    stream_id,
                    String::from_utf8_lossy(frame.payload())
                );
            }
            return Ok(());
        }

        self.reply_error(stream_id, "req not found");
        Err(HandlerError::UnknownStream(stream_id))
    }

    /// Abort the local exchange of a stream the public side abandoned
    pub fn reset(&self, stream_id: u32) {
        if let Some((_, exchange)) = self.exchanges.remove(&stream_id) {
            tracing::debug!("Stream {} reset, aborting local {:?} exchange", stream_id, exchange.kind);
            if let Some(task) = exchange.task {
                task.abort();
            }
        }
    }

    /// Abort every local exchange; used when the tunnel connection ends
    pub fn abandon_all(&self) -> usize {
        let ids: Vec<u32> = self.exchanges.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            self.reset(id);
        }
        count
    }

    /// Issue the local HTTP request and stream the response back
    async fn forward_http(
        self: Arc<Self>,
        stream_id: u32,
        port: u16,
        head: RequestHead,
        frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        let method = head.method.as_deref().unwrap_or("GET");
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                self.reply_error(stream_id, "invalid headers");
                self.finish(stream_id);
                return;
            }
        };

        let url = format!("http://{}:{}{}", LOCAL_HOST, port, normalize_path(&head.path));
        tracing::debug!("Stream {}: {} {}", stream_id, method, url);

        let mut request = self.client.request(method, &url);
        for (name, value) in head.headers.iter() {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("hostname")
            {
                continue;
            }
            request = request.header(name, value);
        }
        if has_body(&head.headers) {
            request = request.body(reqwest::Body::wrap_stream(body_stream(frames)));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Local service on port {} failed for stream {}: {}", port, stream_id, e);
                self.send_response_head(stream_id, 502, HeaderList::from_iter([(
                    "content-type".to_string(),
                    "text/plain".to_string(),
                )]));
                self.send(Frame::data(stream_id, format!("local service unavailable: {}", e)));
                self.send(Frame::end_data(FrameType::Data, stream_id));
                self.finish(stream_id);
                return;
            }
        };

        let status = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        if !self.send_response_head(stream_id, status, headers) {
            self.finish(stream_id);
            return;
        }

        let mut body = response.bytes_stream();
        let mut total = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Local response body of stream {} failed: {}", stream_id, e);
                    break;
                }
            };
            total += chunk.len();
            if !self.send_chunked(stream_id, chunk) {
                self.finish(stream_id);
                return;
            }
        }

        self.send(Frame::end_data(FrameType::Data, stream_id));
        self.finish(stream_id);
        tracing::debug!("Stream {}: {} ({} bytes)", stream_id, status, total);
    }

    fn send_response_head(&self, stream_id: u32, status_code: u16, headers: HeaderList) -> bool {
        let head = ResponseHead {
            status_code,
            headers,
        };
        match serde_json::to_vec(&head) {
            Ok(payload) => self.send(Frame::headers(FrameType::Headers, stream_id, payload)),
            Err(e) => {
                tracing::error!("Failed to encode response head for stream {}: {}", stream_id, e);
                false
            }
        }
    }

    fn send_chunked(&self, stream_id: u32, data: Bytes) -> bool {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_PAYLOAD_LEN).min(data.len());
            if !self.send(Frame::data(stream_id, data.slice(offset..end))) {
                return false;
            }
            offset = end;
        }
        true
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Whether the relayed request declares a body
fn has_body(headers: &HeaderList) -> bool {
    let sized = headers
        .get("content-length")
        .map(|v| v.trim() != "0")
        .unwrap_or(false);
    sized || headers.get("transfer-encoding").is_some()
}

/// Request body fed by the DATA frames of one stream, ending at END_DATA
fn body_stream(
    frames: mpsc::UnboundedReceiver<Frame>,
) -> impl futures_util::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some(frames), |frames| async move {
        let mut frames = frames?;
        match frames.recv().await {
            Some(frame) if frame.is_data_end() => None,
            Some(frame) => Some((Ok(frame.into_payload()), Some(frames))),
            None => Some((
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")),
                None,
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(json: &str) -> ClientSettings {
        serde_json::from_str(json).unwrap()
    }

    fn relay(hosts: HostMap) -> (Arc<LocalRelay>, mpsc::UnboundedReceiver<Frame>) {
        relay_with(hosts, ProtocolRevision::Extended)
    }

    fn relay_with(
        hosts: HostMap,
        revision: ProtocolRevision,
    ) -> (Arc<LocalRelay>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = LocalRelay::new(hosts, LocalRelay::http_client().unwrap(), tx, revision);
        (relay, rx)
    }

    fn exchange_kind(relay: &LocalRelay, stream_id: u32) -> Option<ExchangeKind> {
        relay.exchanges.get(&stream_id).map(|e| e.kind)
    }

    const UPGRADE_HEAD: &str = r#"{"method":"GET","path":"/x","host":"web.t.test","headers":{
        "upgrade":"websocket","connection":"Upgrade","sec-websocket-key":"dGhlIHNhbXBsZSBub25jZQ=="}}"#;

    fn web_hosts() -> HostMap {
        HostMap::from_settings(&settings(
            r#"{"bind_port":1,"bind_host":"s","subdomain_host":"t.test",
                "http":{"a":{"subdomain":"web","local_port":9}}}"#,
        ))
    }

    #[tokio::test]
    async fn test_extended_exchange_kind_follows_frame_type() {
        let (relay, _outbound) = relay(web_hosts());

        // Upgrade-looking headers on a plain HEADERS frame stay HTTP
        relay.open(&head_frame(2, UPGRADE_HEAD)).unwrap();
        assert_eq!(exchange_kind(&relay, 2), Some(ExchangeKind::Http));

        let ws_head = Frame::headers(
            FrameType::WsHeaders,
            4,
            r#"{"path":"/x","host":"web.t.test"}"#.as_bytes().to_vec(),
        );
        relay.open(&ws_head).unwrap();
        assert_eq!(exchange_kind(&relay, 4), Some(ExchangeKind::WebSocket));

        relay.abandon_all();
    }

    #[tokio::test]
    async fn test_legacy_exchange_kind_needs_complete_upgrade() {
        let (relay, _outbound) = relay_with(web_hosts(), ProtocolRevision::Legacy);

        relay.open(&head_frame(2, UPGRADE_HEAD)).unwrap();
        assert_eq!(exchange_kind(&relay, 2), Some(ExchangeKind::WebSocket));

        relay
            .open(&head_frame(
                4,
                r#"{"method":"GET","path":"/","host":"web.t.test","headers":{"upgrade":"websocket"}}"#,
            ))
            .unwrap();
        assert_eq!(exchange_kind(&relay, 4), Some(ExchangeKind::Http));

        relay.abandon_all();
    }

    fn head_frame(stream_id: u32, json: &str) -> Frame {
        Frame::headers(FrameType::Headers, stream_id, json.as_bytes().to_vec())
    }

    #[test]
    fn test_host_map_resolution() {
        let hosts = HostMap::from_settings(&settings(
            r#"{"bind_port":1,"bind_host":"s","subdomain_host":"t.test",
                "http":{"a":{"subdomain":"Web","local_port":3000}}}"#,
        ));

        assert_eq!(hosts.resolve("web.t.test"), Some(3000));
        assert_eq!(hosts.resolve("WEB.T.TEST:8080"), Some(3000));
        assert_eq!(hosts.resolve("api.t.test"), None);
        assert_eq!(hosts.resolve("web.other.test"), None);
    }

    #[test]
    fn test_host_map_without_subdomain_host() {
        let hosts = HostMap::from_settings(&settings(
            r#"{"bind_port":1,"bind_host":"s","http":{"a":{"subdomain":"web","local_port":3000}}}"#,
        ));
        assert_eq!(hosts.resolve("web.fallback.example:80"), Some(3000));
        assert_eq!(hosts.resolve("api.fallback.example"), None);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a?b=1"), "/a?b=1");
        assert_eq!(normalize_path("a"), "/a");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_has_body() {
        let mut headers = HeaderList::new();
        assert!(!has_body(&headers));
        headers.push("Content-Length", "0");
        assert!(!has_body(&headers));
        headers.push("transfer-encoding", "chunked");
        assert!(has_body(&headers));
    }

    #[tokio::test]
    async fn test_routing_errors_answered_on_stream() {
        let (relay, mut outbound) = relay(HostMap::default());

        relay
            .open(&head_frame(2, r#"{"method":"GET","path":"/"}"#))
            .unwrap();
        let reply = outbound.recv().await.unwrap();
        assert_eq!((reply.stream_id(), reply.payload().as_ref()), (2, &b"need host"[..]));
        assert!(reply.is_data_end());

        relay
            .open(&head_frame(4, r#"{"method":"GET","path":"/","host":"x.t.test"}"#))
            .unwrap();
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.payload().as_ref(), b"host not found");

        assert!(relay.open(&head_frame(6, "{oops")).is_err());
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.payload().as_ref(), b"invalid headers");
        assert_eq!(relay.active_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_unknown_stream_data() {
        let (relay, mut outbound) = relay(HostMap::default());

        assert!(relay.deliver(&Frame::data(8, "body")).is_err());
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.stream_id(), 8);
        assert_eq!(reply.payload().as_ref(), b"req not found");

        // A terminator is never answered
        relay
            .deliver(&Frame::end_data(FrameType::Data, 10))
            .unwrap();
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_body_stream_ends_at_terminator() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::data(2, "ab")).unwrap();
        tx.send(Frame::data(2, "cd")).unwrap();
        tx.send(Frame::end_data(FrameType::Data, 2)).unwrap();
        tx.send(Frame::data(2, "ignored")).unwrap();

        let chunks: Vec<Bytes> = body_stream(rx)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from("ab"), Bytes::from("cd")]);
    }

    #[tokio::test]
    async fn test_body_stream_errors_when_tunnel_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::data(2, "ab")).unwrap();
        drop(tx);

        let chunks: Vec<Result<Bytes, io::Error>> = body_stream(rx).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_err());
    }

    #[tokio::test]
    async fn test_unreachable_local_service_answers_502() {
        // Bind then drop a listener to get a port nothing listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let hosts = HostMap::from_settings(&settings(&format!(
            r#"{{"bind_port":1,"bind_host":"s","subdomain_host":"t.test",
                "http":{{"a":{{"subdomain":"a","local_port":{}}}}}}}"#,
            port
        )));
        let (relay, mut outbound) = relay(hosts);

        relay
            .open(&head_frame(2, r#"{"method":"GET","path":"/","host":"a.t.test"}"#))
            .unwrap();

        let head = outbound.recv().await.unwrap();
        assert_eq!(head.kind(), FrameType::Headers);
        assert_eq!(head.json::<ResponseHead>().unwrap().status_code, 502);

        let mut end = outbound.recv().await.unwrap();
        while !end.is_data_end() {
            end = outbound.recv().await.unwrap();
        }
        assert_eq!(end.stream_id(), 2);
    }
}
