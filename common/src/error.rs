//! Wire-level error taxonomy.
//!
//! Framing-level failures ([`WireError::BadTag`], [`WireError::BadLength`],
//! short reads surfacing as [`WireError::Io`]) are unrecoverable for the
//! connection that produced them: the transport drops the peer. Codec
//! failures ([`WireError::Codec`]) affect only the offending frame; the
//! dispatch loop logs them and keeps the connection.

use thiserror::Error;

/// Errors produced by the frame codec, the message layer, and the cipher.
#[derive(Debug, Error)]
pub enum WireError {
    /// The leading frame byte was neither the message nor the stream tag.
    /// Drops the connection.
    #[error("invalid frame tag {0:#04x}")]
    BadTag(u8),

    /// The 8-byte length prefix was negative or exceeded the frame size cap.
    /// Drops the connection.
    #[error("frame length {0} out of range")]
    BadLength(i64),

    /// The control-frame payload did not decode to a known message variant.
    /// Logged; the connection survives.
    #[error("malformed message envelope: {0}")]
    Codec(#[from] serde_json::Error),

    /// Underlying socket or file I/O failure, including short reads of a
    /// length-prefixed body.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The encryption key had the wrong length for AES-256.
    #[error("encryption key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
}

impl WireError {
    /// True when the underlying cause is one of the I/O conditions that
    /// routinely accompany a peer going away mid-conversation.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self,
            WireError::Io(e) if matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::NotConnected
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        let err = WireError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_disconnect());

        let err = WireError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"));
        assert!(!err.is_disconnect());

        assert!(!WireError::BadTag(0x7f).is_disconnect());
    }

    #[test]
    fn display_includes_tag_value() {
        let msg = WireError::BadTag(0x42).to_string();
        assert!(msg.contains("0x42"), "unexpected display: {}", msg);
    }
}
