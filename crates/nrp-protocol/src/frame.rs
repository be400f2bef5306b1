use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;
use crate::messages::ProtocolRevision;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 9;

/// Largest payload a 24-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// Stream ids are 31 bits wide; the top bit is reserved
pub const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Frame kind (the wire `type` byte)
///
/// The table follows the HTTP/2 layout. `WsData` and `WsHeaders` only appear
/// on the wire in the extended protocol revision; the legacy revision carries
/// WebSocket traffic in `Data`/`Headers` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    WsData,
    WsHeaders,
    Unknown(u8),
}

impl FrameType {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::WsData => 0xa,
            FrameType::WsHeaders => 0xb,
            FrameType::Unknown(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            0xa => FrameType::WsData,
            0xb => FrameType::WsHeaders,
            v => FrameType::Unknown(v),
        }
    }

    /// Frame type used for WebSocket messages under a protocol revision
    pub fn ws_data(revision: ProtocolRevision) -> Self {
        match revision {
            ProtocolRevision::Extended => FrameType::WsData,
            ProtocolRevision::Legacy => FrameType::Data,
        }
    }

    /// Frame type used to open a WebSocket exchange under a protocol revision
    pub fn ws_headers(revision: ProtocolRevision) -> Self {
        match revision {
            ProtocolRevision::Extended => FrameType::WsHeaders,
            ProtocolRevision::Legacy => FrameType::Headers,
        }
    }
}

/// Frame modifier (the wire `flag` byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFlag {
    /// Terminates the data direction of an exchange
    EndData,
    /// Settings acknowledgement and pings
    EndStream,
    /// Headers frame is complete
    EndHeaders,
    /// Data frame carries a chunk, not a terminator
    Padded,
    Priority,
    Unknown(u8),
}

impl FrameFlag {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameFlag::EndData => 0x0,
            FrameFlag::EndStream => 0x1,
            FrameFlag::EndHeaders => 0x4,
            FrameFlag::Padded => 0x8,
            FrameFlag::Priority => 0x20,
            FrameFlag::Unknown(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameFlag::EndData,
            0x1 => FrameFlag::EndStream,
            0x4 => FrameFlag::EndHeaders,
            0x8 => FrameFlag::Padded,
            0x20 => FrameFlag::Priority,
            v => FrameFlag::Unknown(v),
        }
    }
}

/// A single protocol unit
///
/// Wire format:
/// ```text
/// +-----------------+--------+--------+---------------------+-----------+
/// | Length (24 bit) | Type   | Flag   | R | Stream id (31)  | Payload   |
/// | big-endian      | 8 bit  | 8 bit  | big-endian          | Length B  |
/// +-----------------+--------+--------+---------------------+-----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameType,
    flag: FrameFlag,
    stream_id: u32,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, flag: FrameFlag, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            flag,
            stream_id: stream_id & STREAM_ID_MASK,
            payload: payload.into(),
        }
    }

    /// Data chunk of an HTTP body (or a legacy WebSocket message)
    pub fn data(stream_id: u32, chunk: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, FrameFlag::Padded, stream_id, chunk)
    }

    /// Empty terminator for the data direction of an exchange
    pub fn end_data(kind: FrameType, stream_id: u32) -> Self {
        Self::new(kind, FrameFlag::EndData, stream_id, Bytes::new())
    }

    /// Terminator that carries a textual routing error
    pub fn error(stream_id: u32, message: &str) -> Self {
        Self::new(
            FrameType::Data,
            FrameFlag::EndData,
            stream_id,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    pub fn headers(kind: FrameType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, FrameFlag::EndHeaders, stream_id, payload)
    }

    pub fn ping(stream_id: u32) -> Self {
        Self::new(FrameType::Ping, FrameFlag::EndStream, stream_id, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(FrameType::RstStream, FrameFlag::EndStream, stream_id, Bytes::new())
    }

    pub fn kind(&self) -> FrameType {
        self.kind
    }

    pub fn flag(&self) -> FrameFlag {
        self.flag
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encoded size including the header
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, FrameType::Data | FrameType::WsData)
    }

    pub fn is_headers(&self) -> bool {
        matches!(self.kind, FrameType::Headers | FrameType::WsHeaders)
    }

    /// Data frame that closes its exchange
    pub fn is_data_end(&self) -> bool {
        self.is_data() && self.flag == FrameFlag::EndData
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = self.payload.len();
        if length > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(length));
        }

        dst.reserve(HEADER_LEN + length);
        // 24-bit length: the low three bytes of a u32
        dst.put_slice(&(length as u32).to_be_bytes()[1..]);
        dst.put_u8(self.kind.to_u8());
        dst.put_u8(self.flag.to_u8());
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one complete frame
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let length = peek_payload_len(bytes).ok_or(CodecError::Truncated(bytes.len()))?;
        if bytes.len() != HEADER_LEN + length {
            return Err(CodecError::LengthMismatch {
                declared: length,
                actual: bytes.len().saturating_sub(HEADER_LEN),
            });
        }

        let mut header = &bytes[3..HEADER_LEN];
        let kind = FrameType::from_u8(header.get_u8());
        let flag = FrameFlag::from_u8(header.get_u8());
        let stream_id = header.get_u32() & STREAM_ID_MASK;

        Ok(Self {
            kind,
            flag,
            stream_id,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }

    /// Parse the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Read the declared payload length from a buffer holding at least a header
pub fn peek_payload_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize)
}

/// Allocator for the stream ids one side of a tunnel originates
///
/// Clients start at 1 and servers at 2; both step by 2, so ids generated
/// independently on each side never collide. The counter wraps inside the
/// 31-bit space and keeps its parity.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: std::sync::atomic::AtomicU32,
    first: u32,
}

impl StreamIdAllocator {
    pub fn client() -> Self {
        Self::starting_at(1)
    }

    pub fn server() -> Self {
        Self::starting_at(2)
    }

    fn starting_at(first: u32) -> Self {
        Self {
            next: std::sync::atomic::AtomicU32::new(first),
            first,
        }
    }

    pub fn next_id(&self) -> u32 {
        use std::sync::atomic::Ordering;

        let first = self.first;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = current.wrapping_add(2);
                Some(if next > STREAM_ID_MASK { first } else { next })
            })
            .unwrap_or(first)
    }
}
