//! Frame-recording TCP proxy for E2E tests
//!
//! Sits between a tunnel client and the server's tunnel listener, forwarding
//! bytes untouched while decoding them into frames in both directions. Tests
//! use the recording to assert exactly what crossed the tunnel, and
//! [`TapProxy::drop_connections`] to simulate a broken tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use nrp_protocol::{Frame, FrameParser, FrameType};

/// Which way a frame was travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Tunnel client to server
    ToServer,
    /// Server to tunnel client
    ToClient,
}

#[derive(Debug, Clone)]
pub struct TappedFrame {
    pub direction: Direction,
    pub frame: Frame,
}

/// A recording proxy in front of a tunnel listener
pub struct TapProxy {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<TappedFrame>>>,
    pumps: Arc<Mutex<Vec<AbortHandle>>>,
    accept: AbortHandle,
}

impl TapProxy {
    /// Start proxying to `upstream` from an ephemeral port
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind tap proxy");
        let addr = listener.local_addr().unwrap();

        let frames: Arc<Mutex<Vec<TappedFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let pumps: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let frames_clone = frames.clone();
        let pumps_clone = pumps.clone();
        let accept = tokio::spawn(async move {
            while let Ok((inbound, _)) = listener.accept().await {
                let outbound = match TcpStream::connect(upstream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("Tap proxy could not reach {}: {}", upstream, e);
                        continue;
                    }
                };

                let (client_read, client_write) = inbound.into_split();
                let (server_read, server_write) = outbound.into_split();

                let up = tokio::spawn(pump(
                    client_read,
                    server_write,
                    Direction::ToServer,
                    frames_clone.clone(),
                ));
                let down = tokio::spawn(pump(
                    server_read,
                    client_write,
                    Direction::ToClient,
                    frames_clone.clone(),
                ));

                let mut pumps = pumps_clone.lock();
                pumps.push(up.abort_handle());
                pumps.push(down.abort_handle());
            }
        })
        .abort_handle();

        Self {
            addr,
            frames,
            pumps,
            accept,
        }
    }

    /// Address tunnel clients should connect to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every frame seen so far, in order of arrival per direction
    pub fn frames(&self) -> Vec<TappedFrame> {
        self.frames.lock().clone()
    }

    /// Number of frames seen so far
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Frames of one stream travelling one way
    pub fn stream(&self, direction: Direction, stream_id: u32) -> Vec<Frame> {
        self.frames
            .lock()
            .iter()
            .filter(|t| t.direction == direction && t.frame.stream_id() == stream_id)
            .map(|t| t.frame.clone())
            .collect()
    }

    /// Number of frames of `kind` travelling one way
    pub fn count(&self, direction: Direction, kind: FrameType) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|t| t.direction == direction && t.frame.kind() == kind)
            .count()
    }

    /// Stream id of the first frame of `kind` travelling one way
    pub fn first_stream(&self, direction: Direction, kind: FrameType) -> Option<u32> {
        self.frames
            .lock()
            .iter()
            .find(|t| t.direction == direction && t.frame.kind() == kind)
            .map(|t| t.frame.stream_id())
    }

    /// Sever every proxied connection; new connections are still accepted
    pub fn drop_connections(&self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }
}

impl Drop for TapProxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn pump(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
    frames: Arc<Mutex<Vec<TappedFrame>>>,
) {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        // Record before forwarding so no effect is observable ahead of its frame
        match parser.push(&buf[..n]) {
            Ok(decoded) => {
                let mut frames = frames.lock();
                frames.extend(
                    decoded
                        .into_iter()
                        .map(|frame| TappedFrame { direction, frame }),
                );
            }
            Err(e) => tracing::warn!("Tap proxy saw undecodable bytes ({:?}): {}", direction, e),
        }

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }

    let _ = writer.shutdown().await;
}
