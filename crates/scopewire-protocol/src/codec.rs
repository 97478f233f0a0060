//! Length-delimited frame codec for stream transports.
//!
//! Wire format: 4-byte big-endian length prefix + raw frame bytes. The frame
//! contents (channel header onwards) are opaque to the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, MAX_FRAME_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing scopewire frames over a byte stream.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_BYTES,
            });
        }

        // Check if we have the full frame
        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            // Reserve space for the rest
            src.reserve(total - src.len());
            return Ok(None);
        }

        // Consume the length prefix
        src.advance(LENGTH_PREFIX_SIZE);

        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        // Write length prefix + frame
        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}
