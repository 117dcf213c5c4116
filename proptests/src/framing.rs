//! Property-based tests for the frame codec.
//!
//! Tests the following invariants:
//! - F-1: Message frame round trip for arbitrary payloads
//! - F-2: Wire layout is tag, 8-byte LE length, payload
//! - F-3: Decoding a stream tag consumes exactly one byte
//! - F-4: Any unknown tag byte is rejected
//! - F-5: Truncated frames surface as I/O errors, not hangs or panics

#![allow(unused_imports)]
use crate::block_on;
use crate::strategies::*;
use common::framing::{read_frame, write_message, Frame, INCOMING_MESSAGE, INCOMING_STREAM};
use common::WireError;
use proptest::prelude::*;
use std::io::Cursor;

async fn encode_message(payload: &[u8]) -> Vec<u8> {
    let mut wire = Cursor::new(Vec::new());
    write_message(&mut wire, payload).await.unwrap();
    wire.into_inner()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// F-1: whatever goes into a message frame comes back out.
    #[test]
    fn prop_message_roundtrip(payload in payload()) {
        let decoded = block_on(async {
            let wire = encode_message(&payload).await;
            let mut r = &wire[..];
            read_frame(&mut r).await.unwrap()
        });
        prop_assert_eq!(decoded, Frame::Message(payload));
    }

    /// F-2: the encoder's layout is bit-exact.
    #[test]
    fn prop_wire_layout(payload in payload()) {
        let wire = block_on(async { encode_message(&payload).await });
        prop_assert_eq!(wire.len(), 1 + 8 + payload.len());
        prop_assert_eq!(wire[0], INCOMING_MESSAGE);
        prop_assert_eq!(&wire[1..9], &(payload.len() as i64).to_le_bytes()[..]);
        prop_assert_eq!(&wire[9..], &payload[..]);
    }

    /// F-3: a stream tag yields the synthetic frame and leaves every
    /// following byte untouched for the stream consumer.
    #[test]
    fn prop_stream_tag_consumes_one_byte(body in payload()) {
        let wire = [&[INCOMING_STREAM][..], &body].concat();
        let remainder = block_on(async {
            let mut r = &wire[..];
            let frame = read_frame(&mut r).await.unwrap();
            assert_eq!(frame, Frame::Stream);
            r.to_vec()
        });
        prop_assert_eq!(remainder, body);
    }

    /// F-4: unknown tags are framing errors.
    #[test]
    fn prop_unknown_tag_rejected(tag in invalid_tag()) {
        let wire = [tag, 0, 0, 0, 0];
        let result = block_on(async {
            let mut r = &wire[..];
            read_frame(&mut r).await
        });
        match result {
            Err(WireError::BadTag(t)) => prop_assert_eq!(t, tag),
            other => prop_assert!(false, "expected BadTag, got {:?}", other),
        }
    }

    /// F-5: truncating an encoded frame anywhere after the tag produces an
    /// I/O error.
    #[test]
    fn prop_truncated_frame_errors(payload in long_payload(), cut in 1usize..40) {
        let result = block_on(async {
            let mut wire = encode_message(&payload).await;
            wire.truncate(wire.len().saturating_sub(cut));
            let mut r = &wire[..];
            read_frame(&mut r).await
        });
        prop_assert!(matches!(result, Err(WireError::Io(_))));
    }
}
