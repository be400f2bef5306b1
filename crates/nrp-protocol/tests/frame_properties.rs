//! Property-based tests for the frame codec and stream parser.
//!
//! - Encoding then decoding reproduces every valid frame
//! - Any split of an encoded byte sequence yields the same frames
//! - Frames for one stream id never surface under another

use std::collections::HashMap;

use nrp_protocol::{Frame, FrameFlag, FrameParser, FrameType, STREAM_ID_MASK};
use proptest::prelude::*;

fn frame_type_strategy() -> impl Strategy<Value = FrameType> {
    any::<u8>().prop_map(FrameType::from_u8)
}

fn frame_flag_strategy() -> impl Strategy<Value = FrameFlag> {
    any::<u8>().prop_map(FrameFlag::from_u8)
}

fn frame_strategy() -> impl Strategy<Value = Frame> {
    (
        frame_type_strategy(),
        frame_flag_strategy(),
        0u32..=STREAM_ID_MASK,
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(kind, flag, stream_id, payload)| Frame::new(kind, flag, stream_id, payload))
}

// Cut points for splitting a byte sequence into chunks
fn split_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..64, 0..40)
}

fn encode_all(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|f| f.encode().unwrap().to_vec())
        .collect()
}

#[test]
fn prop_decode_inverts_encode() {
    proptest!(|(frame in frame_strategy())| {
        let bytes = frame.encode().unwrap();
        prop_assert_eq!(bytes.len(), frame.wire_len());

        let decoded = Frame::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, frame);
    });
}

#[test]
fn prop_chunking_invariance() {
    proptest!(|(frames in prop::collection::vec(frame_strategy(), 1..12), cuts in split_strategy())| {
        let bytes = encode_all(&frames);

        let mut whole = FrameParser::new();
        let expected = whole.push(&bytes).unwrap();
        prop_assert_eq!(&expected, &frames);

        let mut chunked = FrameParser::new();
        let mut got = Vec::new();
        let mut rest = bytes.as_slice();
        for cut in cuts {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(cut.min(rest.len()));
            got.extend(chunked.push(head).unwrap());
            rest = tail;
        }
        got.extend(chunked.push(rest).unwrap());

        prop_assert_eq!(got, expected);
        prop_assert_eq!(chunked.buffered(), 0);
    });
}

#[test]
fn prop_stream_isolation() {
    proptest!(|(
        chunks in prop::collection::vec((0u32..4, prop::collection::vec(any::<u8>(), 1..32)), 1..40),
        cut in 1usize..48,
    )| {
        // Interleave data chunks of four streams on one connection
        let frames: Vec<Frame> = chunks
            .iter()
            .map(|(stream, payload)| Frame::data(2 + stream * 2, payload.clone()))
            .collect();

        let mut expected: HashMap<u32, Vec<u8>> = HashMap::new();
        for (stream, payload) in &chunks {
            expected.entry(2 + stream * 2).or_default().extend(payload);
        }

        let mut parser = FrameParser::new();
        let mut got: HashMap<u32, Vec<u8>> = HashMap::new();
        for chunk in encode_all(&frames).chunks(cut) {
            for frame in parser.push(chunk).unwrap() {
                got.entry(frame.stream_id()).or_default().extend(frame.payload().iter());
            }
        }

        prop_assert_eq!(got, expected);
    });
}
