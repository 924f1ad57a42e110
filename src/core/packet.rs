//! # Envelope
//!
//! The unit exchanged over a connection: a packet type key plus opaque payload
//! bytes produced by that type's serializer.
//!
//! ## Wire Format
//! ```text
//! [uleb128 len][type key utf-8] [uleb128 len][payload]
//! ```

use bytes::Bytes;

use crate::core::bytebuffer::{ByteReader, ByteWriter};
use crate::core::serialization::WireFormat;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Canonical identifier key of the packet type
    pub kind: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Encoded size, used for byte accounting.
    pub fn wire_len(&self) -> usize {
        self.kind.len() + self.payload.len()
    }
}

impl WireFormat for Envelope {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.kind).write_bytes(&self.payload);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let kind = reader.read_string()?;
        let payload = Bytes::copy_from_slice(reader.read_bytes()?);
        Ok(Self { kind, payload })
    }
}
