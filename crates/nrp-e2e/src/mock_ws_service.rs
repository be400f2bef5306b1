//! Mock WebSocket service for E2E tests
//!
//! Echoes every text and binary message back with its original type and
//! records what it received. The first offered subprotocol is accepted. A
//! text message reading `bye` makes the service close the socket itself and
//! wait for the peer to acknowledge.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;

/// A mock WebSocket echo service
pub struct MockWsService {
    addr: SocketAddr,
    messages: Arc<RwLock<Vec<Message>>>,
    offered_protocols: Arc<RwLock<Vec<Option<String>>>>,
    paths: Arc<RwLock<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    close_acks: Arc<AtomicUsize>,
}

impl MockWsService {
    /// Start a mock WebSocket service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock websocket service");
        let addr = listener.local_addr().unwrap();

        let service = Self {
            addr,
            messages: Arc::new(RwLock::new(Vec::new())),
            offered_protocols: Arc::new(RwLock::new(Vec::new())),
            paths: Arc::new(RwLock::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            close_acks: Arc::new(AtomicUsize::new(0)),
        };

        let messages = service.messages.clone();
        let offered = service.offered_protocols.clone();
        let paths = service.paths.clone();
        let closes = service.closes.clone();
        let close_acks = service.close_acks.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let messages = messages.clone();
                let offered = offered.clone();
                let paths = paths.clone();
                let closes = closes.clone();
                let close_acks = close_acks.clone();

                tokio::spawn(async move {
                    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                        paths.write().push(req.uri().to_string());
                        let protocols = req
                            .headers()
                            .get(SEC_WEBSOCKET_PROTOCOL)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        if let Some(first) = protocols
                            .as_deref()
                            .and_then(|p| p.split(',').next())
                            .map(str::trim)
                            .and_then(|p| HeaderValue::from_str(p).ok())
                        {
                            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, first);
                        }
                        offered.write().push(protocols);
                        Ok(resp)
                    };

                    let mut ws = match accept_hdr_async(stream, callback).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            tracing::debug!("Mock websocket handshake failed: {}", e);
                            return;
                        }
                    };

                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(ref text) if text.as_str() == "bye" => {
                                messages.write().push(message.clone());
                                let _ = ws.close(None).await;
                                while let Some(Ok(reply)) = ws.next().await {
                                    if reply.is_close() {
                                        close_acks.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                                break;
                            }
                            Message::Text(_) | Message::Binary(_) => {
                                messages.write().push(message.clone());
                                if ws.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => {
                                closes.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        service
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Messages received, in arrival order
    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    /// `Sec-WebSocket-Protocol` offered on each handshake, if any
    pub fn offered_protocols(&self) -> Vec<Option<String>> {
        self.offered_protocols.read().clone()
    }

    /// Request paths of each handshake
    pub fn paths(&self) -> Vec<String> {
        self.paths.read().clone()
    }

    /// Number of close frames received from clients
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of service-initiated closes the client answered
    pub fn close_ack_count(&self) -> usize {
        self.close_acks.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[tokio::test]
    async fn test_mock_ws_echoes_and_picks_first_protocol() {
        let service = MockWsService::start().await;

        let mut request = format!("ws://127.0.0.1:{}/echo", service.port())
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat, superchat"));

        let (mut ws, response) = connect_async(request).await.unwrap();
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "chat");

        ws.send(Message::text("hi")).await.unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::text("hi"));

        assert_eq!(service.paths(), vec!["/echo".to_string()]);
        assert_eq!(
            service.offered_protocols(),
            vec![Some("chat, superchat".to_string())]
        );
    }
}
