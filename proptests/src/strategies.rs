//! Shared proptest strategies.

use proptest::prelude::*;

/// Arbitrary payloads up to 8 KiB, including empty.
pub fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..8192)
}

/// Payloads of at least 32 bytes, long enough that "ciphertext equals
/// plaintext by chance" has negligible probability.
pub fn long_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 32..8192)
}

/// Arbitrary UTF-8 logical keys, non-empty.
pub fn logical_key() -> impl Strategy<Value = String> {
    ".{1,64}"
}

/// Tag bytes that are neither the message nor the stream tag.
pub fn invalid_tag() -> impl Strategy<Value = u8> {
    any::<u8>().prop_filter("must not be a valid frame tag", |b| *b != 0x1 && *b != 0x2)
}
