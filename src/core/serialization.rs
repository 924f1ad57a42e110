//! # Serialization Formats
//!
//! Pluggable payload encodings for packet types, endpoints and registries.
//!
//! Every typed channel in the engine carries a [`Serializer`] that turns its
//! value into payload bytes and back. Three formats ship with the crate:
//!
//! - **Json**: serde_json text, used by core handshake packets and most
//!   registries (interop with non-Rust peers)
//! - **Binary**: hand-packed [`WireFormat`] values built on the byte buffer
//!   (compact, used by the endpoint protocol)
//! - **Raw**: bytes passed through untouched
//!
//! ## Usage
//! ```rust
//! use brokerlink::core::serialization::{Json, Serializer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Theme { dark: bool }
//!
//! let json = Json::<Theme>::new();
//! let bytes = json.serialize(&Theme { dark: true }).unwrap();
//! assert_eq!(json.deserialize(&bytes).unwrap(), Theme { dark: true });
//! ```

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::bytebuffer::{ByteReader, ByteWriter};
use crate::error::{ProtocolError, Result};

/// Encodes and decodes values of `T` to payload bytes.
pub trait Serializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T) -> Result<Bytes>;
    fn deserialize(&self, data: &[u8]) -> Result<T>;
}

/// Values with a hand-written binary layout.
pub trait WireFormat: Sized {
    fn encode(&self, writer: &mut ByteWriter);
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.finish()
    }

    /// Decode a complete buffer; trailing bytes are rejected.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let value = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

/// serde_json encoding.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Json")
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}

/// [`WireFormat`] encoding.
pub struct Binary<T>(PhantomData<fn() -> T>);

impl<T> Binary<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Binary<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Binary<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Binary")
    }
}

impl<T> Serializer<T> for Binary<T>
where
    T: WireFormat + 'static,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        Ok(value.to_bytes())
    }

    fn deserialize(&self, data: &[u8]) -> Result<T> {
        T::from_bytes(data)
    }
}

/// Passes bytes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Raw;

impl Serializer<Bytes> for Raw {
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn deserialize(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}
