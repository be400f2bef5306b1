//! Wire protocol for nrp tunnel connections
//!
//! One tunnel connection multiplexes many HTTP and WebSocket exchanges.
//! Every exchange is a stream of [`Frame`]s sharing a stream id.

mod codec;
mod frame;
mod messages;
mod parser;

pub use codec::{CodecError, FrameCodec};
pub use frame::{
    peek_payload_len, Frame, FrameFlag, FrameType, StreamIdAllocator, HEADER_LEN,
    MAX_PAYLOAD_LEN, STREAM_ID_MASK,
};
pub use messages::{
    decode_ws_message, encode_ws_message, is_hop_by_hop, Backoff, ClientSettings, HeaderList,
    HttpSetting, ProtocolRevision, RequestHead, ResponseHead, SettingsAck,
};
pub use parser::{FrameHandler, FrameParser, FrameStream, HandlerError};
