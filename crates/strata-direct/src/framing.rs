//! Length-prefixed frame codec.
//!
//! Every message on a node connection travels as a frame:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, LE)       | Body             |
//! +----------------------------+------------------+
//! ```
//!
//! The length counts the body only. Zero-length bodies are legal frames and
//! are yielded like any other. The codec buffers partial input across calls
//! and yields each body as soon as its final byte arrives; it applies no
//! timeout of its own — deadlines belong to the connection above it.
//!
//! A length prefix above the configured maximum is a [`FramingError`]:
//! the stream position can no longer be trusted, so the owning connection
//! escalates it to a fatal teardown. The length is validated before any
//! allocation is made for the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FramingError, TransportError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for length-prefixed frames, used through
/// [`Framed`](tokio_util::codec::Framed).
///
/// Decoding yields complete frame bodies as [`Bytes`]; encoding prepends
/// the little-endian length to an outgoing body.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default maximum frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a specific maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the configured maximum frame size.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_le_bytes(prefix) as usize;

        if length > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            }
            .into());
        }

        if src.len() < LENGTH_PREFIX_SIZE + length {
            // Reserve what the rest of this frame needs so the next read
            // can complete it in one pass.
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if body.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                length: body.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(body: &[u8]) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(body), &mut buf)
            .expect("encode");
        buf
    }

    #[test]
    fn round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(b"the quick brown fox");

        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(&frame[..], b"the quick brown fox");
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_body_is_yielded() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(b"");

        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert!(frame.is_empty());
    }

    #[test]
    fn partial_feed_matches_single_feed() {
        let bodies: &[&[u8]] = &[b"alpha", b"", b"gamma delta"];

        let mut whole = BytesMut::new();
        for body in bodies {
            whole.extend_from_slice(&encode_frame(body));
        }

        // All at once.
        let mut codec = FrameCodec::new();
        let mut all_at_once = Vec::new();
        let mut buf = whole.clone();
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            all_at_once.push(frame);
        }

        // One byte at a time.
        let mut codec = FrameCodec::new();
        let mut one_by_one = Vec::new();
        let mut buf = BytesMut::new();
        for byte in whole.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut buf).expect("decode") {
                one_by_one.push(frame);
            }
        }

        assert_eq!(all_at_once, one_by_one);
        assert_eq!(all_at_once.len(), bodies.len());
        for (frame, body) in all_at_once.iter().zip(bodies) {
            assert_eq!(&frame[..], *body);
        }
    }

    #[test]
    fn incomplete_frame_yields_nothing() {
        let mut codec = FrameCodec::new();
        let full = encode_frame(b"incomplete");

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        // Remainder is held; the final byte completes the frame.
        buf.extend_from_slice(&full[full.len() - 1..]);
        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(&frame[..], b"incomplete");
    }

    #[test]
    fn oversized_length_is_rejected_before_body_arrives() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        buf.put_u32_le(9);

        let err = codec.decode(&mut buf).expect_err("oversized");
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::FrameTooLarge { length: 9, max: 8 })
        ));
    }

    #[test]
    fn encoder_rejects_oversized_body() {
        let mut codec = FrameCodec::with_max_frame_size(4);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(Bytes::from_static(b"12345"), &mut buf)
            .expect_err("oversized");
        assert!(matches!(err, TransportError::Framing(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(b"one");
        buf.extend_from_slice(&encode_frame(b"two"));

        let first = codec.decode(&mut buf).expect("decode").expect("frame");
        let second = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
        assert!(codec.decode(&mut buf).expect("decode").is_none());
    }
}
