use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{peek_payload_len, Frame, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),

    #[error("Truncated frame: {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),

    #[error("Frame length mismatch: header declares {declared} payload bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunnel frame codec for framed I/O
///
/// Decoding never looks at the payload; see [`Frame::json`] for that.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the full header to know the payload length
        let Some(length) = peek_payload_len(src) else {
            return Ok(None);
        };

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            // Reserve space for the full frame
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total_len);
        Frame::decode(&raw).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
