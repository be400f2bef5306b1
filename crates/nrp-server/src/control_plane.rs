use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;

use nrp_protocol::{
    ClientSettings, Frame, FrameCodec, FrameFlag, FrameHandler, FrameStream, FrameType,
    HandlerError, SettingsAck,
};

use crate::registry::ClientRegistry;
use crate::session::TunnelSession;

/// Tunnel listener: accepts client connections and runs their sessions
pub struct ControlPlane {
    registry: Arc<ClientRegistry>,
    idle_timeout: Duration,
}

impl ControlPlane {
    pub fn new(registry: Arc<ClientRegistry>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            idle_timeout,
        })
    }

    /// Start listening for tunnel client connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Accept tunnel connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Control plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn FrameHandler<Arc<TunnelSession>>>> {
        vec![
            Arc::new(SettingsHandler {
                registry: self.registry.clone(),
            }),
            Arc::new(ExchangeHandler),
        ]
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        tracing::info!("New tunnel connection from {}", peer_addr);
        stream.set_nodelay(true)?;

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let session = TunnelSession::new(peer_addr, tx);

        // Single writer per connection keeps frames whole on the wire
        let write_handle = tokio::spawn(async move {
            let mut codec = FrameCodec::new();
            let mut write_buf = BytesMut::with_capacity(8192);

            while let Some(frame) = rx.recv().await {
                write_buf.clear();
                let stream_id = frame.stream_id();
                if let Err(e) = codec.encode(frame, &mut write_buf) {
                    tracing::error!("Failed to encode frame for stream {}: {}", stream_id, e);
                    continue;
                }
                if let Err(e) = write_half.write_all(&write_buf).await {
                    tracing::error!("Failed to write to tunnel {}: {}", peer_addr, e);
                    break;
                }
            }
        });

        let mut frames = FrameStream::new(self.handlers());
        loop {
            let read = tokio::time::timeout(
                self.idle_timeout,
                read_half.read_buf(frames.parser_mut().buffer_mut()),
            )
            .await;

            match read {
                Err(_) => {
                    tracing::info!(
                        "Tunnel {} idle for {:?}, closing",
                        peer_addr,
                        self.idle_timeout
                    );
                    break;
                }
                Ok(Ok(0)) => {
                    tracing::info!("Tunnel client {} disconnected", peer_addr);
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::error!("Read error from {}: {}", peer_addr, e);
                    break;
                }
            }

            if let Err(e) = frames.dispatch_buffered(&session) {
                tracing::error!("Undecodable frame from {}: {}", peer_addr, e);
                break;
            }
        }

        // Cleanup
        if let Some(client) = self.registry.unregister(&session) {
            tracing::info!(
                "Client {} unregistered ({} domains)",
                client.id,
                client.domains.len()
            );
        }
        let abandoned = session.abandon_all();
        if abandoned > 0 {
            tracing::info!("Abandoned {} pending exchanges of {}", abandoned, peer_addr);
        }

        write_handle.abort();
        Ok(())
    }
}

/// Answers the SETTINGS handshake and registers the client
struct SettingsHandler {
    registry: Arc<ClientRegistry>,
}

impl FrameHandler<Arc<TunnelSession>> for SettingsHandler {
    fn handle(&self, frame: &Frame, session: &Arc<TunnelSession>) -> Result<(), HandlerError> {
        if frame.kind() != FrameType::Settings {
            return Ok(());
        }
        let stream_id = frame.stream_id();

        let settings: ClientSettings = match frame.json() {
            Ok(settings) => settings,
            Err(source) => {
                session
                    .send(Frame::error(stream_id, "invalid settings"))
                    .map_err(|_| HandlerError::TunnelClosed)?;
                return Err(HandlerError::Payload { stream_id, source });
            }
        };

        let revision = settings.protocol;
        let id = match self.registry.register(session, settings) {
            Ok(id) => id,
            Err(e) => {
                session
                    .send(Frame::error(stream_id, &e.to_string()))
                    .map_err(|_| HandlerError::TunnelClosed)?;
                return Err(HandlerError::Other(e.to_string()));
            }
        };
        session.set_revision(revision);

        let ack = serde_json::to_vec(&SettingsAck { id })
            .map_err(|e| HandlerError::Other(e.to_string()))?;
        session
            .send(Frame::new(FrameType::Settings, FrameFlag::EndStream, stream_id, ack))
            .map_err(|_| HandlerError::TunnelClosed)?;

        tracing::info!(
            "Client {} registered from {} ({:?} protocol)",
            id,
            session.peer_addr(),
            revision
        );
        Ok(())
    }
}

/// Routes relay frames to the public exchange waiting on their stream
struct ExchangeHandler;

impl FrameHandler<Arc<TunnelSession>> for ExchangeHandler {
    fn handle(&self, frame: &Frame, session: &Arc<TunnelSession>) -> Result<(), HandlerError> {
        match frame.kind() {
            FrameType::Headers
            | FrameType::WsHeaders
            | FrameType::Data
            | FrameType::WsData
            | FrameType::RstStream => session.route(frame),
            FrameType::Ping => {
                tracing::trace!("Ping from {} on stream {}", session.peer_addr(), frame.stream_id());
                Ok(())
            }
            FrameType::Settings => Ok(()),
            other => {
                tracing::debug!("Ignoring {:?} frame on stream {}", other, frame.stream_id());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExchangeKind;
    use nrp_protocol::FrameParser;

    fn session() -> (Arc<TunnelSession>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TunnelSession::new("127.0.0.1:9".parse().unwrap(), tx), rx)
    }

    fn settings_frame(stream_id: u32, json: &str) -> Frame {
        Frame::new(
            FrameType::Settings,
            FrameFlag::EndHeaders,
            stream_id,
            json.as_bytes().to_vec(),
        )
    }

    const SETTINGS: &str = r#"{"bind_port":7000,"bind_host":"localhost","subdomain_host":"t.test",
        "protocol":"legacy","http":{"a":{"subdomain":"a","local_port":3000}}}"#;

    #[test]
    fn test_settings_registers_and_acks() {
        let registry = ClientRegistry::new(None);
        let handler = SettingsHandler {
            registry: registry.clone(),
        };
        let (session, mut outbound) = session();

        handler.handle(&settings_frame(1, SETTINGS), &session).unwrap();

        let ack = outbound.try_recv().unwrap();
        assert_eq!(ack.kind(), FrameType::Settings);
        assert_eq!(ack.flag(), FrameFlag::EndStream);
        assert_eq!(ack.stream_id(), 1);
        assert_eq!(ack.json::<SettingsAck>().unwrap().id, 1);
        assert!(registry.resolve("a.t.test").is_some());
        assert_eq!(session.revision(), nrp_protocol::ProtocolRevision::Legacy);
    }

    #[test]
    fn test_malformed_settings_answered_with_error() {
        let registry = ClientRegistry::new(None);
        let handler = SettingsHandler {
            registry: registry.clone(),
        };
        let (session, mut outbound) = session();

        let err = handler
            .handle(&settings_frame(3, "{not json"), &session)
            .unwrap_err();
        assert!(matches!(err, HandlerError::Payload { stream_id: 3, .. }));

        let reply = outbound.try_recv().unwrap();
        assert!(reply.is_data_end());
        assert_eq!(reply.payload().as_ref(), b"invalid settings");
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_exchange_handler_routes_by_stream() {
        let (session, _outbound) = session();
        let (id, mut rx) = session.open_exchange(ExchangeKind::Http);

        ExchangeHandler
            .handle(&Frame::data(id, "chunk"), &session)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().payload().as_ref(), b"chunk");

        let err = ExchangeHandler
            .handle(&Frame::data(id + 2, "stray"), &session)
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownStream(_)));
    }

    #[tokio::test]
    async fn test_connection_close_unregisters_client() {
        let registry = ClientRegistry::new(None);
        let plane = ControlPlane::new(registry.clone(), Duration::from_secs(60));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(plane.run_with_listener(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&settings_frame(1, SETTINGS).encode().unwrap())
            .await
            .unwrap();

        // Wait for the ack
        let mut parser = FrameParser::new();
        let ack = loop {
            client.read_buf(parser.buffer_mut()).await.unwrap();
            if let Some(frame) = parser.next_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(ack.json::<SettingsAck>().unwrap().id, 1);
        assert!(registry.resolve("a.t.test").is_some());

        drop(client);
        for _ in 0..50 {
            if registry.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.client_count(), 0);
        assert!(registry.resolve("a.t.test").is_none());
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let registry = ClientRegistry::new(None);
        let plane = ControlPlane::new(registry, Duration::from_millis(50));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(plane.run_with_listener(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
