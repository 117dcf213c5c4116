//! Common types and algorithms for the Meshvault storage mesh.
//!
//! This crate provides shared functionality used by the node binary and the
//! property-test crate:
//! - **Protocol messages**: the four control messages exchanged between peers
//! - **Frame codec**: the two-mode wire framing (control frames and raw
//!   stream bodies) carried over a single TCP connection
//! - **Stream cipher**: AES-CTR-256 streaming encrypt/decrypt with a random
//!   16-byte IV prefix, used for at-rest encryption in the CAS
//! - **Content hashing**: the MD5 wire identifier and the SHA-1 split-path
//!   derivation for on-disk CAS layout
//!
//! # Protocol Overview
//!
//! Every peer connection carries discrete control frames (a tag byte, an
//! 8-byte little-endian length, and an encoded [`NodeMessage`]) interleaved
//! with raw stream bodies (a bare tag byte followed by exactly as many bytes
//! as the preceding [`NodeMessage::StoreFile`] announced). The receiving side
//! serializes the two modes with a per-peer stream barrier: after a stream
//! tag is observed, no further frame is decoded from that connection until
//! the consumer signals that the body has been drained.

pub mod crypto;
pub mod error;
pub mod framing;

pub use error::WireError;

use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol Messages
// ============================================================================

/// Control messages exchanged between storage nodes.
///
/// Encoded as self-describing JSON (externally tagged enum) inside a
/// length-prefixed control frame, so the receiver dispatches on the concrete
/// variant without a separate discriminator field. The encoding is
/// deterministic for a given message value.
///
/// The `key` field of every file-addressed variant is the *wire identifier*
/// of the logical key: the hex MD5 of the user-chosen key string (see
/// [`crypto::hash_key`]). Nodes address their CAS by this identifier, so the
/// same logical key lands at the same on-disk path on every node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NodeMessage {
    /// Announces an incoming stream body of exactly `size` plaintext bytes.
    /// The receiver must register a pending transfer for the sending peer and
    /// write the body to its CAS under `key`.
    StoreFile {
        /// Wire identifier of the file (hex MD5 of the logical key)
        key: String,
        /// Plaintext byte count of the stream body that follows
        size: i64,
    },
    /// Asks any receiver holding `key` to respond with a `StoreFile` frame
    /// followed by the decrypted file content as a stream body.
    GetFile {
        /// Wire identifier of the requested file
        key: String,
    },
    /// Asks the receiver to delete its CAS entry (and metadata row) for `key`.
    /// Remote deletes are hints; the receiver proceeds best-effort.
    DeleteFile {
        /// Wire identifier of the file to delete
        key: String,
    },
    /// Gossip of known peer addresses for mesh expansion beyond the
    /// bootstrap set.
    PeerExchange {
        /// Active peers known to the sender, including the sender itself
        peers: Vec<PeerInfo>,
    },
}

/// A single gossiped peer address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Dialable TCP address (`host:port`)
    pub address: String,
    /// Unix timestamp (seconds) the sender last saw this peer
    pub last_seen: u64,
}

impl NodeMessage {
    /// Encodes the message for transmission inside a control frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a control-frame payload. Failures are codec errors: the
    /// offending frame is dropped but the connection survives.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Current Unix timestamp in seconds. Returns 0 if the system clock is
/// before the epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_file_roundtrip() {
        let msg = NodeMessage::StoreFile {
            key: "9e107d9d372bb6826bd81d3542a419d6".to_string(),
            size: 1024,
        };
        let bytes = msg.encode().unwrap();
        match NodeMessage::decode(&bytes).unwrap() {
            NodeMessage::StoreFile { key, size } => {
                assert_eq!(key, "9e107d9d372bb6826bd81d3542a419d6");
                assert_eq!(size, 1024);
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn get_file_roundtrip() {
        let msg = NodeMessage::GetFile {
            key: "abc123".to_string(),
        };
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            NodeMessage::decode(&bytes).unwrap(),
            NodeMessage::GetFile { key } if key == "abc123"
        ));
    }

    #[test]
    fn delete_file_roundtrip() {
        let msg = NodeMessage::DeleteFile {
            key: "abc123".to_string(),
        };
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            NodeMessage::decode(&bytes).unwrap(),
            NodeMessage::DeleteFile { key } if key == "abc123"
        ));
    }

    #[test]
    fn peer_exchange_roundtrip() {
        let peers = vec![
            PeerInfo {
                address: "127.0.0.1:3000".to_string(),
                last_seen: 1_700_000_000,
            },
            PeerInfo {
                address: "127.0.0.1:4000".to_string(),
                last_seen: 1_700_000_123,
            },
        ];
        let msg = NodeMessage::PeerExchange {
            peers: peers.clone(),
        };
        let bytes = msg.encode().unwrap();
        match NodeMessage::decode(&bytes).unwrap() {
            NodeMessage::PeerExchange { peers: decoded } => assert_eq!(decoded, peers),
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = NodeMessage::StoreFile {
            key: "k".to_string(),
            size: 7,
        };
        assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(NodeMessage::decode(b"not json at all").is_err());
        assert!(NodeMessage::decode(b"{\"Unknown\":{}}").is_err());
    }
}
