//! Length-prefixed frame codec for the session protocol.
//!
//! Each frame on the socket is:
//!
//! ```text
//! +------------+------------------------+------------------+
//! | Kind (1B)  | Length (4 bytes, LE)   | Payload          |
//! +------------+------------------------+------------------+
//! ```
//!
//! The codec enforces bounded reads: the payload length is validated
//! against [`MAX_PAYLOAD_SIZE`] before any allocation, and an oversized
//! frame is a fatal protocol error that tears the connection down. The
//! kind byte is passed through undecoded; the dispatcher answers unknown
//! kinds with a protocol error instead of dropping the client.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crt_core::wire::{HEADER_LEN, MAX_PAYLOAD_SIZE};
use tokio_util::codec::{Decoder, Encoder};

/// Framing-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame announced a payload larger than the protocol allows.
    #[error("frame too large: {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Protocol limit.
        max: usize,
    },

    /// Transport-level I/O failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw protocol frame: kind byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire kind byte, not yet validated.
    pub kind: u8,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame from a kind and payload.
    #[must_use]
    pub fn new(kind: impl Into<u8>, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Encodes the frame into a single buffer, header included.
    ///
    /// Used where frames are queued as flat byte chunks rather than
    /// driven through a `Framed` sink.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind);
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_SIZE
        let length = self.payload.len() as u32;
        buf.put_u32_le(length);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Frame codec implementing the header format above.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    /// Decodes one frame, validating the length before allocating.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let length = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;

        // Validate before reserving anything for the payload.
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u8(item.kind);
        #[allow(clippy::cast_possible_truncation)] // validated above
        let length = item.payload.len() as u32;
        dst.put_u32_le(length);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crt_core::wire::MessageKind;

    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(MessageKind::Ping as u8, Bytes::from_static(b"12345678"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        // Header: kind then little-endian length.
        assert_eq!(buf[0], 0x1A);
        assert_eq!(&buf[1..5], &[8, 0, 0, 0]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x01u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = FrameCodec::new();
        // Header promises 10 payload bytes, only 4 present.
        let mut buf = BytesMut::from(&[0x0Cu8, 10, 0, 0, 0, 1, 2, 3, 4][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn decode_rejects_oversized_frame_before_buffering() {
        let mut codec = FrameCodec::new();
        let oversized = (MAX_PAYLOAD_SIZE + 1) as u32;
        let mut buf = BytesMut::new();
        buf.put_u8(0x0C);
        buf.put_u32_le(oversized);
        buf.extend_from_slice(&[0u8; 64]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size, max }
                if size == oversized as usize && max == MAX_PAYLOAD_SIZE
        ));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(0x0Du8, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));

        let mut buf = BytesMut::new();
        assert!(codec.encode(frame, &mut buf).is_err());
    }

    #[test]
    fn empty_payload_frame() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(MessageKind::List as u8, Bytes::new());

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.kind, MessageKind::List as u8);
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let first = Frame::new(0x0Cu8, Bytes::from_static(b"first"));
        let second = Frame::new(0x0Du8, Bytes::from_static(b"second"));

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn to_bytes_matches_encoder_output() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(0x05u8, Bytes::from_static(b"chunk"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(frame.to_bytes(), buf.freeze());
    }
}
