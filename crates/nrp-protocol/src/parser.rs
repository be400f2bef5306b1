//! Incremental frame reassembly and handler dispatch
//!
//! A tunnel connection delivers an ordered byte stream with arbitrary chunk
//! boundaries. [`FrameParser`] keeps the unconsumed bytes and cuts complete
//! frames out of them; [`FrameStream`] adds the connection's ordered list of
//! [`FrameHandler`]s and hands every extracted frame to each of them in turn.

use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::codec::{CodecError, FrameCodec};
use crate::frame::Frame;

/// Errors a frame handler reports back to the dispatcher
///
/// These are logged by the dispatcher; they never stop the remaining
/// handlers and never close the tunnel connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Malformed payload on stream {stream_id}: {source}")]
    Payload {
        stream_id: u32,
        #[source]
        source: CodecError,
    },

    #[error("No pending exchange for stream {0}")]
    UnknownStream(u32),

    #[error("Tunnel connection closed")]
    TunnelClosed,

    #[error("{0}")]
    Other(String),
}

/// A reaction to decoded frames on one tunnel connection
///
/// Handlers see every frame and pick the ones they care about. `C` is the
/// per-connection context (the session the frame arrived on).
pub trait FrameHandler<C: ?Sized>: Send + Sync {
    fn handle(&self, frame: &Frame, conn: &C) -> Result<(), HandlerError>;
}

/// Byte accumulator that yields complete frames
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
    codec: FrameCodec,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            codec: FrameCodec::new(),
        }
    }

    /// Buffer to read socket data into directly
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and extract every complete frame, in order
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.buffer.extend_from_slice(chunk);
        self.drain()
    }

    /// Extract every complete frame already buffered, in order
    pub fn drain(&mut self) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Extract one complete frame, leaving any remainder buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        self.codec.decode(&mut self.buffer)
    }
}

/// Parser plus the ordered handler list for one connection
pub struct FrameStream<C: ?Sized> {
    parser: FrameParser,
    handlers: Vec<Arc<dyn FrameHandler<C>>>,
}

impl<C: ?Sized> FrameStream<C> {
    pub fn new(handlers: Vec<Arc<dyn FrameHandler<C>>>) -> Self {
        Self {
            parser: FrameParser::new(),
            handlers,
        }
    }

    pub fn parser_mut(&mut self) -> &mut FrameParser {
        &mut self.parser
    }

    /// Append a chunk and dispatch every frame it completes
    ///
    /// Returns the number of frames dispatched.
    pub fn feed(&mut self, chunk: &[u8], conn: &C) -> Result<usize, CodecError> {
        self.parser.buffer_mut().extend_from_slice(chunk);
        self.dispatch_buffered(conn)
    }

    /// Dispatch every complete frame currently in the parser buffer
    pub fn dispatch_buffered(&mut self, conn: &C) -> Result<usize, CodecError> {
        let mut count = 0;
        while let Some(frame) = self.parser.next_frame()? {
            self.dispatch(&frame, conn);
            count += 1;
        }
        Ok(count)
    }

    /// Hand one frame to every handler in registration order
    pub fn dispatch(&self, frame: &Frame, conn: &C) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(frame, conn) {
                tracing::warn!(
                    "Handler failed for {:?} frame on stream {}: {}",
                    frame.kind(),
                    frame.stream_id(),
                    e
                );
            }
        }
    }
}
