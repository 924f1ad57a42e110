//! Core packets exchanged during connection setup and teardown.
//!
//! All core packets live under the `core:packet/` namespace and carry JSON
//! payloads.

use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::core::identifier::Identifier;
use crate::error::ProtocolError;
use crate::protocol::handshake::{EncryptionDescriptor, EncryptionMaterial};
use crate::protocol::packet::PacketType;

/// Protocol version sent in the connect packet
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub version: String,
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// First packet of every session, sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMeta {
    pub protocol: ProtocolInfo,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub app: App,
    pub protocol: ProtocolInfo,
    /// Cleartext token; `None` when the token travels in `encryption`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionMaterial>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectType {
    InvalidToken,
    InvalidOrigin,
    InvalidVersion,
    InvalidPacketType,
    InvalidPacketData,
    InvalidPacket,
    InternalError,
    AnotherConnection,
    PermissionDenied,
    ServerRestart,
    Shutdown,
    Close,
}

impl DisconnectType {
    /// The server expects the client to come back.
    pub fn is_retryable(self) -> bool {
        matches!(self, DisconnectType::ServerRestart | DisconnectType::InternalError)
    }

    /// Deliberate end of the session; no error, no retry.
    pub fn is_clean(self) -> bool {
        matches!(self, DisconnectType::Shutdown | DisconnectType::Close)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectType::InvalidToken => "invalid_token",
            DisconnectType::InvalidOrigin => "invalid_origin",
            DisconnectType::InvalidVersion => "invalid_version",
            DisconnectType::InvalidPacketType => "invalid_packet_type",
            DisconnectType::InvalidPacketData => "invalid_packet_data",
            DisconnectType::InvalidPacket => "invalid_packet",
            DisconnectType::InternalError => "internal_error",
            DisconnectType::AnotherConnection => "another_connection",
            DisconnectType::PermissionDenied => "permission_denied",
            DisconnectType::ServerRestart => "server_restart",
            DisconnectType::Shutdown => "shutdown",
            DisconnectType::Close => "close",
        }
    }
}

impl fmt::Display for DisconnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPacket {
    #[serde(rename = "type")]
    pub kind: DisconnectType,
    #[serde(default)]
    pub message: Option<String>,
}

impl DisconnectPacket {
    pub fn new(kind: DisconnectType, message: Option<String>) -> Self {
        Self { kind, message }
    }

    /// Typed error for this reason. Clean endings have none.
    pub fn to_error(&self) -> Option<ProtocolError> {
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string());
        let error = match self.kind {
            DisconnectType::InvalidToken => ProtocolError::InvalidToken(message),
            DisconnectType::InvalidOrigin => ProtocolError::InvalidOrigin(message),
            DisconnectType::InvalidVersion => ProtocolError::InvalidVersion(message),
            DisconnectType::InvalidPacketType
            | DisconnectType::InvalidPacketData
            | DisconnectType::InvalidPacket => ProtocolError::InvalidPacket(message),
            DisconnectType::InternalError => ProtocolError::InternalError(message),
            DisconnectType::AnotherConnection => ProtocolError::AnotherConnection(message),
            DisconnectType::PermissionDenied => ProtocolError::PermissionDenied(message),
            DisconnectType::ServerRestart => ProtocolError::ConnectionClosed,
            DisconnectType::Shutdown | DisconnectType::Close => return None,
        };
        Some(error)
    }
}

fn core_packet(name: &'static str) -> Identifier {
    Identifier::from_static("core", &["packet", name])
}

pub static SERVER_META: LazyLock<PacketType<ServerMeta>> =
    LazyLock::new(|| PacketType::json(core_packet("server_meta")));

pub static CONNECT: LazyLock<PacketType<ConnectPacket>> =
    LazyLock::new(|| PacketType::json(core_packet("connect")));

pub static DISCONNECT: LazyLock<PacketType<DisconnectPacket>> =
    LazyLock::new(|| PacketType::json(core_packet("disconnect")));

/// Server-issued replacement token
pub static TOKEN: LazyLock<PacketType<String>> =
    LazyLock::new(|| PacketType::json(core_packet("token")));

pub static READY: LazyLock<PacketType<()>> =
    LazyLock::new(|| PacketType::json(core_packet("ready")));
