use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::codec::Encoder;

use nrp_protocol::{
    Backoff, ClientSettings, Frame, FrameCodec, FrameFlag, FrameHandler, FrameStream, FrameType,
    HandlerError, SettingsAck, StreamIdAllocator,
};

use crate::forwarder::{HostMap, LocalRelay};

/// Default interval between keep-alive pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on one connect attempt, in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Lifecycle of the client's tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
    Reconnecting,
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Tunnel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("Undecodable frame from server: {0}")]
    Codec(#[from] nrp_protocol::CodecError),

    #[error("Gave up after {0} consecutive failed attempts")]
    RetriesExhausted(u32),
}

/// Reconnect delay for the given 1-based attempt
///
/// Capped exponential: `min * factor^(attempt-1)`, never above `max`.
pub fn backoff_delay(backoff: &Backoff, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let delay = backoff.min as f64 * backoff.factor.max(1.0).powi(exponent);
    let capped = delay.min(backoff.max as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Client side of the tunnel: connects, handshakes and reconnects
pub struct TunnelClient {
    settings: ClientSettings,
    hosts: HostMap,
    http: reqwest::Client,
    ping_interval: Duration,
    state: watch::Sender<ClientState>,
    client_id: watch::Sender<Option<u64>>,
}

impl TunnelClient {
    pub fn new(settings: ClientSettings, ping_interval: Duration) -> Result<Arc<Self>, ClientError> {
        let hosts = HostMap::from_settings(&settings);
        let http = LocalRelay::http_client().map_err(|e| io::Error::other(e.to_string()))?;
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (client_id, _) = watch::channel(None);

        Ok(Arc::new(Self {
            settings,
            hosts,
            http,
            ping_interval,
            state,
            client_id,
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Id the server acknowledged for the current connection
    pub fn client_id(&self) -> Option<u64> {
        *self.client_id.borrow()
    }

    /// Watch handshake acknowledgements; reset to `None` on every reconnect
    pub fn registrations(&self) -> watch::Receiver<Option<u64>> {
        self.client_id.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Client state {:?} -> {:?}", previous, state);
        }
    }

    fn server_addr(&self) -> String {
        format!("{}:{}", self.settings.bind_host, self.settings.bind_port)
    }

    /// Keep a tunnel connection up until retries run out
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        let backoff = self.settings.backoff.unwrap_or_default();
        let max_attempts = self.settings.retry.filter(|r| *r > 0);
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ClientState::Connecting);
            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    match self.serve(stream).await {
                        Ok(()) => tracing::info!("Tunnel closed by server"),
                        Err(e) => tracing::warn!("Tunnel connection lost: {}", e),
                    }
                }
                Err(e) => tracing::warn!("{}", e),
            }

            attempt += 1;
            if let Some(max) = max_attempts {
                if attempt > max {
                    self.set_state(ClientState::Disconnected);
                    return Err(ClientError::RetriesExhausted(max));
                }
            }

            let delay = backoff_delay(&backoff, attempt);
            self.set_state(ClientState::Reconnecting);
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run until `shutdown` resolves, then drop the tunnel connection
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        let this = self.clone();
        let result = tokio::select! {
            result = this.run() => result,
            _ = shutdown => {
                self.set_state(ClientState::Closing);
                Ok(())
            }
        };
        self.client_id.send_replace(None);
        self.set_state(ClientState::Disconnected);
        result
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let addr = self.server_addr();
        let timeout = Duration::from_millis(self.settings.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS));
        tracing::info!("Connecting to {}...", addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => return Err(ClientError::ConnectTimeout { addr, timeout }),
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn handlers() -> Vec<Arc<dyn FrameHandler<TunnelConnection>>> {
        vec![
            Arc::new(SettingsAckHandler),
            Arc::new(RelayHeadersHandler),
            Arc::new(RelayDataHandler),
            Arc::new(ResetHandler),
        ]
    }

    /// Handshake on a fresh connection and serve it until it closes
    async fn serve(&self, stream: TcpStream) -> Result<(), ClientError> {
        self.set_state(ClientState::Handshaking);
        self.client_id.send_replace(None);

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

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
                    tracing::error!("Failed to write to tunnel: {}", e);
                    break;
                }
            }

            if let Err(e) = write_half.shutdown().await {
                tracing::debug!("Tunnel shutdown: {}", e);
            }
        });

        let conn = TunnelConnection {
            outbound: tx.clone(),
            stream_ids: StreamIdAllocator::client(),
            relay: LocalRelay::new(self.hosts.clone(), self.http.clone(), tx, self.settings.protocol),
            client_id: self.client_id.clone(),
        };
        // Also runs when the caller drops this future on shutdown
        let _teardown = Teardown {
            relay: conn.relay.clone(),
            writer: write_handle.abort_handle(),
        };

        let result = self.serve_frames(&conn, &mut read_half).await;
        self.client_id.send_replace(None);
        result
    }

    async fn serve_frames(
        &self,
        conn: &TunnelConnection,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
    ) -> Result<(), ClientError> {
        let settings = serde_json::to_vec(&self.settings)?;
        conn.send(Frame::new(
            FrameType::Settings,
            FrameFlag::EndHeaders,
            conn.stream_ids.next_id(),
            settings,
        ));
        self.set_state(ClientState::Active);
        tracing::info!(
            "Tunnel to {} active, exposing {} services",
            self.server_addr(),
            self.hosts.len()
        );

        let mut frames = FrameStream::new(Self::handlers());
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                read = read_half.read_buf(frames.parser_mut().buffer_mut()) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    frames.dispatch_buffered(conn)?;
                }
                _ = ping.tick() => {
                    conn.send(Frame::ping(conn.stream_ids.next_id()));
                }
            }
        }
    }
}

/// Per-connection context the client's frame handlers run against
pub struct TunnelConnection {
    outbound: mpsc::UnboundedSender<Frame>,
    stream_ids: StreamIdAllocator,
    relay: Arc<LocalRelay>,
    client_id: watch::Sender<Option<u64>>,
}

impl TunnelConnection {
    fn send(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!("Tunnel writer gone, frame dropped");
        }
    }
}

/// Abandons local exchanges and stops the writer when a connection ends
struct Teardown {
    relay: Arc<LocalRelay>,
    writer: AbortHandle,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let abandoned = self.relay.abandon_all();
        if abandoned > 0 {
            tracing::info!("Abandoned {} local exchanges", abandoned);
        }
        self.writer.abort();
    }
}

/// Records the id the server assigned in its SETTINGS reply
struct SettingsAckHandler;

impl FrameHandler<TunnelConnection> for SettingsAckHandler {
    fn handle(&self, frame: &Frame, conn: &TunnelConnection) -> Result<(), HandlerError> {
        if frame.kind() != FrameType::Settings {
            return Ok(());
        }
        let ack: SettingsAck = frame.json().map_err(|source| HandlerError::Payload {
            stream_id: frame.stream_id(),
            source,
        })?;
        conn.client_id.send_replace(Some(ack.id));
        tracing::info!("Registered with server as client {}", ack.id);
        Ok(())
    }
}

struct RelayHeadersHandler;

impl FrameHandler<TunnelConnection> for RelayHeadersHandler {
    fn handle(&self, frame: &Frame, conn: &TunnelConnection) -> Result<(), HandlerError> {
        if !frame.is_headers() {
            return Ok(());
        }
        conn.relay.open(frame)
    }
}

struct RelayDataHandler;

impl FrameHandler<TunnelConnection> for RelayDataHandler {
    fn handle(&self, frame: &Frame, conn: &TunnelConnection) -> Result<(), HandlerError> {
        if !frame.is_data() {
            return Ok(());
        }
        conn.relay.deliver(frame)
    }
}

struct ResetHandler;

impl FrameHandler<TunnelConnection> for ResetHandler {
    fn handle(&self, frame: &Frame, conn: &TunnelConnection) -> Result<(), HandlerError> {
        if frame.kind() == FrameType::RstStream {
            conn.relay.reset(frame.stream_id());
        }
        Ok(())
    }
}
