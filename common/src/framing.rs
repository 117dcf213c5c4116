//! The two-mode wire framing shared by every peer connection.
//!
//! A connection carries two kinds of frames, distinguished by a 1-byte
//! leading tag:
//!
//! | Tag | Layout | Meaning |
//! |-----|--------|---------|
//! | [`INCOMING_MESSAGE`] (`0x1`) | tag, 8-byte LE signed length, payload | An encoded control message |
//! | [`INCOMING_STREAM`] (`0x2`) | tag only | A raw stream body follows on the socket |
//!
//! The stream frame deliberately carries no length: the body size travels
//! out-of-band in the preceding `StoreFile` control message, and the body
//! bytes are consumed off the raw connection by whoever registered the
//! pending transfer — not by this codec.
//!
//! Callers must hand the decoder an *unbuffered* reader. A buffered reader
//! would read ahead past the stream tag and swallow body bytes that belong
//! to the stream consumer.

use crate::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Tag byte announcing a length-prefixed control frame.
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Tag byte announcing a raw stream body.
pub const INCOMING_STREAM: u8 = 0x2;

/// Upper bound on a control-frame payload. Anything larger is a framing
/// error and drops the connection.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// One decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete control-frame payload.
    Message(Vec<u8>),
    /// A stream tag was observed; the body is still on the socket.
    Stream,
}

/// Reads the next frame off `r`.
///
/// On [`Frame::Stream`] the function returns immediately after the tag byte;
/// the caller owns consuming the body before asking for another frame.
/// Tag and length violations are framing errors; so are short reads.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag).await?;

    match tag[0] {
        INCOMING_STREAM => Ok(Frame::Stream),
        INCOMING_MESSAGE => {
            let mut len_bytes = [0u8; 8];
            r.read_exact(&mut len_bytes).await?;
            let len = i64::from_le_bytes(len_bytes);
            if len < 0 || len as usize > MAX_MESSAGE_SIZE {
                return Err(WireError::BadLength(len));
            }

            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).await?;
            Ok(Frame::Message(payload))
        }
        other => Err(WireError::BadTag(other)),
    }
}

/// Writes a complete control frame (tag, length, payload) as a single write.
pub async fn write_message<W>(w: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1 + 8 + payload.len());
    buf.push(INCOMING_MESSAGE);
    buf.extend_from_slice(&(payload.len() as i64).to_le_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Writes the bare stream tag. The caller streams the body immediately after.
pub async fn write_stream_tag<W>(w: &mut W) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[INCOMING_STREAM]).await?;
    Ok(())
}
