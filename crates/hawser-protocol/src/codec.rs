//! Tokio codec for framed protocol messages
//!
//! Frames are length-prefixed JSON: a 4-byte big-endian u32 payload
//! length, then the JSON document. The length prefix is validated before
//! the payload is buffered, so an oversized announcement fails fast
//! instead of growing the read buffer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Envelope;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size (4 MiB).
///
/// Terminal output rides base64-encoded inside JSON and is chunked at the
/// PTY read size well below this; anything larger indicates a corrupt or
/// hostile peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload length from a prefix whose payload has not arrived yet
    pending_len: Option<usize>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Read the length prefix if we don't have one
        let payload_len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None); // Need more data
                }
                let len = src.get_u32() as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len,
                        max: MAX_FRAME_SIZE,
                    });
                }
                len
            }
        };

        // Check if we have enough data for the payload
        if src.len() < payload_len {
            // Save the length and wait for more data
            self.pending_len = Some(payload_len);
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        // Extract and deserialize the payload
        let payload = src.split_to(payload_len);
        let envelope: Envelope = serde_json::from_slice(&payload)?;

        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&envelope)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
