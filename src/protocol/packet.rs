//! # Packet Types and Mapper
//!
//! A [`PacketType`] binds an [`Identifier`] to the serializer for its payload.
//! The [`PacketMapper`] is the registry of known types: it turns typed values
//! into [`Envelope`]s on the way out and envelopes into type-erased
//! [`Packet`]s on the way in.
//!
//! Each identifier may be registered once. An incoming envelope whose kind is
//! not registered is a protocol fault, not something to skip.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::identifier::Identifier;
use crate::core::packet::Envelope;
use crate::core::serialization::{Binary, Json, Serializer, WireFormat};
use crate::error::{ProtocolError, Result};

pub type PacketData = Arc<dyn Any + Send + Sync>;

/// Identifier plus payload serializer for values of `T`.
pub struct PacketType<T> {
    id: Identifier,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> Clone for PacketType<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<T> fmt::Debug for PacketType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketType({})", self.id)
    }
}

impl<T: Send + Sync + 'static> PacketType<T> {
    pub fn new(id: Identifier, serializer: impl Serializer<T>) -> Self {
        Self {
            id,
            serializer: Arc::new(serializer),
        }
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn serialize(&self, value: &T) -> Result<Bytes> {
        self.serializer.serialize(value)
    }

    pub fn deserialize(&self, data: &[u8]) -> Result<T> {
        self.serializer.deserialize(data)
    }

    pub fn envelope(&self, value: &T) -> Result<Envelope> {
        Ok(Envelope::new(self.id.key(), self.serialize(value)?))
    }
}

impl<T> PacketType<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn json(id: Identifier) -> Self {
        Self::new(id, Json::new())
    }
}

impl<T> PacketType<T>
where
    T: WireFormat + Send + Sync + 'static,
{
    pub fn binary(id: Identifier) -> Self {
        Self::new(id, Binary::new())
    }
}

/// A decoded packet whose payload type is recovered with [`Packet::downcast`].
#[derive(Clone)]
pub struct Packet {
    pub id: Identifier,
    pub data: PacketData,
}

impl Packet {
    pub fn new<T: Send + Sync + 'static>(packet_type: &PacketType<T>, data: T) -> Self {
        Self {
            id: packet_type.id.clone(),
            data: Arc::new(data),
        }
    }

    pub fn is<T: 'static>(&self, packet_type: &PacketType<T>) -> bool {
        self.id == packet_type.id && self.data.is::<T>()
    }

    /// Typed payload if this packet belongs to `packet_type`.
    pub fn downcast<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>) -> Option<Arc<T>> {
        if self.id != packet_type.id {
            return None;
        }
        Arc::clone(&self.data).downcast::<T>().ok()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.id)
    }
}

/// Type-erased decoder held by the mapper.
trait ErasedPacketType: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<PacketData>;
}

impl<T: Send + Sync + 'static> ErasedPacketType for PacketType<T> {
    fn decode(&self, data: &[u8]) -> Result<PacketData> {
        Ok(Arc::new(self.deserialize(data)?))
    }
}

/// Registry of packet types keyed by identifier.
#[derive(Default)]
pub struct PacketMapper {
    types: RwLock<HashMap<Identifier, Arc<dyn ErasedPacketType>>>,
}

impl PacketMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>) -> Result<()> {
        let mut types = self
            .types
            .write()
            .map_err(|_| ProtocolError::InvalidState("packet mapper lock poisoned".into()))?;
        if types.contains_key(&packet_type.id) {
            return Err(ProtocolError::DuplicateRegistration(packet_type.id.key()));
        }
        types.insert(packet_type.id.clone(), Arc::new(packet_type.clone()));
        Ok(())
    }

    pub fn is_registered(&self, id: &Identifier) -> bool {
        self.types
            .read()
            .map(|types| types.contains_key(id))
            .unwrap_or(false)
    }

    /// Encode a typed value. Only registered types may be sent.
    pub fn serialize<T: Send + Sync + 'static>(
        &self,
        packet_type: &PacketType<T>,
        value: &T,
    ) -> Result<Envelope> {
        if !self.is_registered(&packet_type.id) {
            return Err(ProtocolError::UnregisteredPacket(packet_type.id.key()));
        }
        packet_type.envelope(value)
    }

    /// Decode an incoming envelope into a packet.
    pub fn deserialize(&self, envelope: &Envelope) -> Result<Packet> {
        let id = Identifier::from_key(&envelope.kind)?;
        let decoder = self
            .types
            .read()
            .map_err(|_| ProtocolError::InvalidState("packet mapper lock poisoned".into()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| ProtocolError::UnregisteredPacket(envelope.kind.clone()))?;
        let data = decoder.decode(&envelope.payload)?;
        Ok(Packet { id, data })
    }
}

impl fmt::Debug for PacketMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.types.read().map(|types| types.len()).unwrap_or(0);
        f.debug_struct("PacketMapper").field("types", &count).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    fn greeting_type() -> PacketType<Greeting> {
        PacketType::json(Identifier::from_static("test", &["greeting"]))
    }

    #[test]
    fn test_register_and_roundtrip() {
        let mapper = PacketMapper::new();
        let packet_type = greeting_type();
        mapper.register(&packet_type).unwrap();

        let value = Greeting { text: "hi".into() };
        let envelope = mapper.serialize(&packet_type, &value).unwrap();
        assert_eq!(envelope.kind, "test:greeting");

        let packet = mapper.deserialize(&envelope).unwrap();
        assert!(packet.is(&packet_type));
        assert_eq!(*packet.downcast(&packet_type).unwrap(), value);
    }

    #[test]
    fn test_duplicate_registration() {
        let mapper = PacketMapper::new();
        mapper.register(&greeting_type()).unwrap();
        assert!(matches!(
            mapper.register(&greeting_type()),
            Err(ProtocolError::DuplicateRegistration(_))
        ));
    }

    #[test]
    fn test_unregistered_types() {
        let mapper = PacketMapper::new();
        let packet_type = greeting_type();
        assert!(matches!(
            mapper.serialize(&packet_type, &Greeting { text: "x".into() }),
            Err(ProtocolError::UnregisteredPacket(_))
        ));
        assert!(matches!(
            mapper.deserialize(&Envelope::new("test:unknown", &b"{}"[..])),
            Err(ProtocolError::UnregisteredPacket(_))
        ));
        assert!(matches!(
            mapper.deserialize(&Envelope::new("not a key", &b"{}"[..])),
            Err(ProtocolError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let mapper = PacketMapper::new();
        mapper.register(&greeting_type()).unwrap();
        assert!(matches!(
            mapper.deserialize(&Envelope::new("test:greeting", &b"[1,2]"[..])),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn test_downcast_wrong_type() {
        let other: PacketType<Greeting> =
            PacketType::json(Identifier::from_static("test", &["other"]));
        let packet = Packet::new(&greeting_type(), Greeting { text: "a".into() });
        assert!(packet.downcast(&other).is_none());
        assert!(!packet.is(&other));
    }
}
