//! Registry packets and the `get` endpoint.

use std::sync::LazyLock;

use bytes::Bytes;

use crate::core::bytebuffer::{ByteReader, ByteWriter, Flags};
use crate::core::identifier::Identifier;
use crate::core::serialization::{Binary, Json, WireFormat};
use crate::error::Result;
use crate::extension::endpoint::EndpointType;
use crate::protocol::packet::PacketType;

/// Current value of a registry; `None` when the server holds nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPacket {
    pub id: Identifier,
    pub value: Option<Bytes>,
}

impl WireFormat for RegistryPacket {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_bool(self.value.is_some());
        if let Some(value) = &self.value {
            writer.write_bytes(value);
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let id = Identifier::from_key(&reader.read_string()?)?;
        let value = if reader.read_bool()? {
            Some(Bytes::copy_from_slice(reader.read_bytes()?))
        } else {
            None
        };
        Ok(Self { id, value })
    }
}

/// Permissions required to touch a registry owned by this app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryPermissions {
    pub all: Option<Identifier>,
    pub read: Option<Identifier>,
    pub write: Option<Identifier>,
}

const PERMISSION_FLAGS: u8 = 3;

impl RegistryPermissions {
    fn slots(&self) -> [&Option<Identifier>; 3] {
        [&self.all, &self.read, &self.write]
    }
}

impl WireFormat for RegistryPermissions {
    fn encode(&self, writer: &mut ByteWriter) {
        let mut flags = Flags::fixed(PERMISSION_FLAGS);
        for (position, slot) in self.slots().into_iter().enumerate() {
            flags.set(position as u8, slot.is_some());
        }
        writer.write_flags(&flags);
        for id in self.slots().into_iter().flatten() {
            writer.write_string(&id.key());
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let flags = reader.read_flags(PERMISSION_FLAGS)?;
        let mut read_slot = |position: u8| -> Result<Option<Identifier>> {
            if flags.get(position) {
                Ok(Some(Identifier::from_key(&reader.read_string()?)?))
            } else {
                Ok(None)
            }
        };
        Ok(Self {
            all: read_slot(0)?,
            read: read_slot(1)?,
            write: read_slot(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRegisterPacket {
    pub id: Identifier,
    pub permissions: RegistryPermissions,
}

impl WireFormat for RegistryRegisterPacket {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        self.permissions.encode(writer);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: Identifier::from_key(&reader.read_string()?)?,
            permissions: RegistryPermissions::decode(reader)?,
        })
    }
}

fn registry_id(name: &'static str) -> Identifier {
    Identifier::from_static("ext", &["registry", name])
}

/// Required to read registries through the `get` endpoint.
pub static REGISTRY_PERMISSION_ID: LazyLock<Identifier> =
    LazyLock::new(|| registry_id("permission"));

pub static REGISTER: LazyLock<PacketType<RegistryRegisterPacket>> =
    LazyLock::new(|| PacketType::binary(registry_id("register")));

pub static UPDATE: LazyLock<PacketType<RegistryPacket>> =
    LazyLock::new(|| PacketType::binary(registry_id("update")));

pub static LISTEN: LazyLock<PacketType<Identifier>> =
    LazyLock::new(|| PacketType::json(registry_id("listen")));

pub static GET: LazyLock<EndpointType<Identifier, RegistryPacket>> = LazyLock::new(|| {
    EndpointType::new(registry_id("get"), Json::new(), Binary::new())
        .with_permission(REGISTRY_PERMISSION_ID.clone())
});

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id() -> Identifier {
        Identifier::from_static("com.example", &["app", "counter"])
    }

    #[test]
    fn test_absent_value() {
        let packet = RegistryPacket {
            id: id(),
            value: None,
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(RegistryPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_permission_flags() {
        let permission = Identifier::from_static("com.example", &["app", "write"]);
        let packet = RegistryRegisterPacket {
            id: id(),
            permissions: RegistryPermissions {
                all: None,
                read: None,
                write: Some(permission.clone()),
            },
        };
        let bytes = packet.to_bytes();
        let flags_at = 1 + id().key().len();
        assert_eq!(bytes[flags_at], 0b100);

        let decoded = RegistryRegisterPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.permissions.write, Some(permission));
        assert_eq!(decoded.permissions.all, None);
    }

    #[test]
    fn test_get_endpoint_permission() {
        assert_eq!(GET.id().key(), "ext:registry/get");
        assert_eq!(GET.permission(), Some(&*REGISTRY_PERMISSION_ID));
    }
}
