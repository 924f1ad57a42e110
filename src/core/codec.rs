//! # Envelope Codec
//!
//! Tokio codec framing [`Envelope`]s over byte streams.
//!
//! Each frame is a ULEB128 length followed by that many bytes of encoded
//! envelope. Partial frames stay in the buffer until more data arrives; the
//! length is checked against `max_frame` before anything is allocated.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::bytebuffer::ByteWriter;
use crate::core::packet::Envelope;
use crate::core::serialization::WireFormat;
use crate::error::{constants, ProtocolError, Result};

/// Default maximum frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest possible ULEB128 encoding of a u64
const MAX_HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_frame: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Peek a length prefix. `Ok(None)` when the prefix is not complete yet.
fn peek_length(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (index, byte) in src.iter().take(MAX_HEADER_LEN).enumerate() {
        let bits = u64::from(byte & 0x7f);
        let shift = 7 * index as u32;
        if shift == 63 && bits > 1 {
            return Err(ProtocolError::DeserializeError(
                constants::ERR_ULEB128_OVERFLOW.into(),
            ));
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if src.len() >= MAX_HEADER_LEN {
        return Err(ProtocolError::DeserializeError(
            constants::ERR_ULEB128_OVERFLOW.into(),
        ));
    }
    Ok(None)
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((length, header)) = peek_length(src)? else {
            return Ok(None);
        };
        let length = usize::try_from(length).unwrap_or(usize::MAX);
        if length > self.max_frame {
            return Err(ProtocolError::InvalidPacket(format!(
                "frame of {length} bytes exceeds limit of {}",
                self.max_frame
            )));
        }
        if src.len() < header + length {
            src.reserve(header + length - src.len());
            return Ok(None);
        }
        src.advance(header);
        let frame = src.split_to(length).freeze();
        Envelope::from_bytes(&frame).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = item.to_bytes();
        if body.len() > self.max_frame {
            return Err(ProtocolError::SerializeError(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame
            )));
        }
        let mut header = ByteWriter::with_capacity(MAX_HEADER_LEN);
        header.write_uleb128(body.len() as u64);
        dst.reserve(header.len() + body.len());
        dst.put_slice(&header.finish());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode() {
        let mut codec = EnvelopeCodec::default();
        let mut buffer = BytesMut::new();
        let envelope = Envelope::new("core:packet/ready", &b"null"[..]);
        codec.encode(envelope.clone(), &mut buffer).unwrap();

        // 1 byte header + 1 + 17 + 1 + 4
        assert_eq!(buffer.len(), 24);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(envelope));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_preserves_buffer() {
        let mut codec = EnvelopeCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::new("a:b", &b"payload"[..]), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 5);

        partial.extend_from_slice(&full[5..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = EnvelopeCodec::default();
        let mut buffer = BytesMut::new();
        codec.encode(Envelope::new("a:one", Vec::<u8>::new()), &mut buffer).unwrap();
        codec.encode(Envelope::new("a:two", Vec::<u8>::new()), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().kind, "a:one");
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().kind, "a:two");
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = EnvelopeCodec::new(8);
        let mut buffer = BytesMut::from(&[0x80, 0x01][..]); // 128
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::InvalidPacket(_))
        ));
        assert!(codec
            .encode(Envelope::new("a:b", vec![0u8; 16]), &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn test_runaway_length_prefix() {
        let mut codec = EnvelopeCodec::default();
        let mut buffer = BytesMut::from(&[0xff; 12][..]);
        assert!(codec.decode(&mut buffer).is_err());
    }
}
