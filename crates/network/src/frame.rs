//! Length-prefixed framing for post-handshake traffic.
//!
//! Frames are laid out as:
//! - 4 bytes: big-endian payload length
//! - N bytes: payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::FrameError;

/// Header size: 4 bytes length.
pub const HEADER_SIZE: usize = 4;

/// Codec for length-prefixed frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    warn_threshold: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            // warn at 90% of the limit
            warn_threshold: max_frame_size - max_frame_size / 10,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = (&src[..HEADER_SIZE]).get_u32() as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        if length >= self.warn_threshold {
            warn!(
                size = length,
                max = self.max_frame_size,
                "incoming frame is close to the maximum frame size"
            );
        }

        src.advance(HEADER_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
