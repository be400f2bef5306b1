use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use nrp_protocol::{Frame, FrameType, HandlerError, ProtocolRevision, StreamIdAllocator};

/// What kind of public exchange a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Http,
    WebSocket,
}

/// A public exchange waiting for frames from the tunnel
pub struct PendingExchange {
    pub kind: ExchangeKind,
    /// Frames for this stream, in arrival order
    pub sender: mpsc::UnboundedSender<Frame>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Tunnel connection closed")]
    Closed,
}

/// Server side of one tunnel connection
///
/// Owns the connection's outbound frame queue, the counter for
/// server-originated stream ids and the pending exchanges keyed by stream id.
/// Created when a tunnel connection is accepted and closed with it.
pub struct TunnelSession {
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    stream_ids: StreamIdAllocator,
    pending: DashMap<u32, PendingExchange>,
    revision: Mutex<ProtocolRevision>,
    client_id: Mutex<Option<u64>>,
}

impl TunnelSession {
    pub fn new(peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            peer_addr,
            outbound,
            stream_ids: StreamIdAllocator::server(),
            pending: DashMap::new(),
            revision: Mutex::new(ProtocolRevision::default()),
            client_id: Mutex::new(None),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a frame for the tunnel connection
    pub fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.outbound.send(frame).map_err(|_| SessionError::Closed)
    }

    pub fn revision(&self) -> ProtocolRevision {
        *self.revision.lock()
    }

    pub fn set_revision(&self, revision: ProtocolRevision) {
        *self.revision.lock() = revision;
    }

    /// Id assigned by the registry once the handshake completed
    pub fn client_id(&self) -> Option<u64> {
        *self.client_id.lock()
    }

    pub(crate) fn set_client_id(&self, id: Option<u64>) {
        *self.client_id.lock() = id;
    }

    /// Allocate a stream id and register a pending exchange for it
    ///
    /// Ids still held by a live exchange are skipped once the counter wraps.
    pub fn open_exchange(&self, kind: ExchangeKind) -> (u32, mpsc::UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream_id = loop {
            let candidate = self.stream_ids.next_id();
            if let Entry::Vacant(slot) = self.pending.entry(candidate) {
                slot.insert(PendingExchange { kind, sender });
                break candidate;
            }
        };
        (stream_id, receiver)
    }

    /// Drop the pending exchange for a stream
    pub fn finish_exchange(&self, stream_id: u32) -> bool {
        self.pending.remove(&stream_id).is_some()
    }

    /// Deliver a frame from the tunnel to its pending exchange
    ///
    /// A data terminator or reset also removes the exchange.
    pub fn route(&self, frame: &Frame) -> Result<(), HandlerError> {
        let stream_id = frame.stream_id();
        let closing = frame.is_data_end() || frame.kind() == FrameType::RstStream;

        let delivered = match self.pending.get(&stream_id) {
            Some(exchange) => exchange.sender.send(frame.clone()).is_ok(),
            None => return Err(HandlerError::UnknownStream(stream_id)),
        };

        if closing || !delivered {
            self.pending.remove(&stream_id);
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn exchange_kind(&self, stream_id: u32) -> Option<ExchangeKind> {
        self.pending.get(&stream_id).map(|e| e.kind)
    }

    /// Drop every pending exchange; their owners see the tunnel as closed
    pub fn abandon_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// Keeps a public exchange registered on its session
///
/// Dropping the guard before [`ExchangeGuard::finish`] means the public side
/// went away mid-exchange: the pending entry is removed and the relay is told
/// with a reset frame.
pub struct ExchangeGuard {
    session: Arc<TunnelSession>,
    stream_id: u32,
    finished: bool,
}

impl ExchangeGuard {
    pub fn new(session: Arc<TunnelSession>, stream_id: u32) -> Self {
        Self {
            session,
            stream_id,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }

    /// Mark the exchange as complete on both sides
    pub fn finish(&mut self) {
        self.finished = true;
        self.session.finish_exchange(self.stream_id);
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.session.finish_exchange(self.stream_id);
        if self.session.send(Frame::reset(self.stream_id)).is_ok() {
            tracing::debug!("Stream {} abandoned by public side, sent reset", self.stream_id);
        }
    }
}
