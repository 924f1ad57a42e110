//! Binary packets of the endpoint extension.
//!
//! Identifiers travel as their key strings, correlation keys as ULEB128 and
//! payloads as length-prefixed bytes.

use std::sync::LazyLock;

use bytes::Bytes;

use crate::core::bytebuffer::{ByteReader, ByteWriter, Flags};
use crate::core::identifier::Identifier;
use crate::core::serialization::WireFormat;
use crate::error::Result;
use crate::protocol::packet::PacketType;

fn write_identifier(writer: &mut ByteWriter, id: &Identifier) {
    writer.write_string(&id.key());
}

fn read_identifier(reader: &mut ByteReader<'_>) -> Result<Identifier> {
    Identifier::from_key(&reader.read_string()?)
}

/// Every endpoint bound by this client with its optional permission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointRegisterPacket {
    pub endpoints: Vec<(Identifier, Option<Identifier>)>,
}

impl WireFormat for EndpointRegisterPacket {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_uleb128(self.endpoints.len() as u64);
        for (id, permission) in &self.endpoints {
            write_identifier(writer, id);
            writer.write_string(&permission.as_ref().map(Identifier::key).unwrap_or_default());
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.read_uleb128()?;
        let mut endpoints = Vec::new();
        for _ in 0..count {
            let id = read_identifier(reader)?;
            let permission = reader.read_string()?;
            let permission = if permission.is_empty() {
                None
            } else {
                Some(Identifier::from_key(&permission)?)
            };
            endpoints.push((id, permission));
        }
        Ok(Self { endpoints })
    }
}

/// Caller to broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInvokePacket {
    pub id: Identifier,
    pub key: u64,
    pub payload: Bytes,
}

impl WireFormat for EndpointInvokePacket {
    fn encode(&self, writer: &mut ByteWriter) {
        write_identifier(writer, &self.id);
        writer.write_uleb128(self.key).write_bytes(&self.payload);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: read_identifier(reader)?,
            key: reader.read_uleb128()?,
            payload: Bytes::copy_from_slice(reader.read_bytes()?),
        })
    }
}

/// Broker to the client serving the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInvokedPacket {
    pub id: Identifier,
    pub caller: Identifier,
    pub key: u64,
    pub payload: Bytes,
}

impl WireFormat for EndpointInvokedPacket {
    fn encode(&self, writer: &mut ByteWriter) {
        write_identifier(writer, &self.id);
        write_identifier(writer, &self.caller);
        writer.write_uleb128(self.key).write_bytes(&self.payload);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: read_identifier(reader)?,
            caller: read_identifier(reader)?,
            key: reader.read_uleb128()?,
            payload: Bytes::copy_from_slice(reader.read_bytes()?),
        })
    }
}

/// Result of an invocation. Bit 0 of the flags marks an error description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResponsePacket {
    pub id: Identifier,
    pub key: u64,
    pub error: Option<String>,
    pub payload: Bytes,
}

impl EndpointResponsePacket {
    pub fn ok(id: Identifier, key: u64, payload: Bytes) -> Self {
        Self {
            id,
            key,
            error: None,
            payload,
        }
    }

    pub fn err(id: Identifier, key: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            key,
            error: Some(error.into()),
            payload: Bytes::new(),
        }
    }
}

const RESPONSE_FLAGS: u8 = 1;
const FLAG_ERROR: u8 = 0;

impl WireFormat for EndpointResponsePacket {
    fn encode(&self, writer: &mut ByteWriter) {
        let mut flags = Flags::fixed(RESPONSE_FLAGS);
        flags.set(FLAG_ERROR, self.error.is_some());
        write_identifier(writer, &self.id);
        writer.write_uleb128(self.key).write_flags(&flags);
        if let Some(error) = &self.error {
            writer.write_string(error);
        }
        writer.write_bytes(&self.payload);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let id = read_identifier(reader)?;
        let key = reader.read_uleb128()?;
        let flags = reader.read_flags(RESPONSE_FLAGS)?;
        let error = if flags.get(FLAG_ERROR) {
            Some(reader.read_string()?)
        } else {
            None
        };
        let payload = Bytes::copy_from_slice(reader.read_bytes()?);
        Ok(Self {
            id,
            key,
            error,
            payload,
        })
    }
}

fn endpoint_packet(name: &'static str) -> Identifier {
    Identifier::from_static("ext", &["endpoint", name])
}

pub static REGISTER: LazyLock<PacketType<EndpointRegisterPacket>> =
    LazyLock::new(|| PacketType::binary(endpoint_packet("register")));

pub static INVOKE: LazyLock<PacketType<EndpointInvokePacket>> =
    LazyLock::new(|| PacketType::binary(endpoint_packet("invoke")));

pub static INVOKED: LazyLock<PacketType<EndpointInvokedPacket>> =
    LazyLock::new(|| PacketType::binary(endpoint_packet("invoked")));

pub static RESPONSE: LazyLock<PacketType<EndpointResponsePacket>> =
    LazyLock::new(|| PacketType::binary(endpoint_packet("response")));

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    fn id(name: &'static str) -> Identifier {
        Identifier::from_static("com.example", &["app", name])
    }

    #[test]
    fn test_response_error_flag() {
        let ok = EndpointResponsePacket::ok(id("sum"), 7, Bytes::from_static(b"42"));
        let bytes = ok.to_bytes();
        // key, flags byte, payload
        assert_eq!(&bytes[bytes.len() - 5..], &[7, 0, 2, b'4', b'2']);
        assert_eq!(EndpointResponsePacket::from_bytes(&bytes).unwrap(), ok);

        let err = EndpointResponsePacket::err(id("sum"), 8, "boom");
        let decoded = EndpointResponsePacket::from_bytes(&err.to_bytes()).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("boom"));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_register_permissions() {
        let packet = EndpointRegisterPacket {
            endpoints: vec![
                (id("open"), None),
                (id("admin"), Some(id("admin_permission"))),
            ],
        };
        let decoded = EndpointRegisterPacket::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_invoked_rejects_bad_identifier() {
        let mut writer = ByteWriter::new();
        writer
            .write_string("no namespace")
            .write_string("com.example:caller")
            .write_uleb128(1)
            .write_bytes(b"");
        assert!(matches!(
            EndpointInvokedPacket::from_bytes(&writer.finish()),
            Err(ProtocolError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_packet_keys() {
        assert_eq!(INVOKE.id().key(), "ext:endpoint/invoke");
        assert_eq!(RESPONSE.id().key(), "ext:endpoint/response");
    }
}
