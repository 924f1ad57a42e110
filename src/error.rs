//! # Error Types
//!
//! Error handling for the session engine.
//!
//! This module defines every error variant that can occur while encoding
//! packets, negotiating a session, calling endpoints or synchronizing
//! registries.
//!
//! ## Error Categories
//! - **Codec Errors**: truncated input, trailing bytes, invalid identifiers
//! - **Protocol Faults**: unregistered packet types, unknown endpoints,
//!   unexpected handshake messages (fatal, never retried)
//! - **Disconnect Reasons**: typed errors for fatal server disconnects
//! - **Transport Errors**: I/O failures and closed connections (retried)
//! - **Endpoint Errors**: a remote handler failed; delivered to the caller only
//! - **Precondition Violations**: double registration, binding after start
//!
//! ## Example Usage
//! ```rust
//! use brokerlink::error::{ProtocolError, Result};
//! use brokerlink::core::identifier::Identifier;
//!
//! fn parse(key: &str) -> Result<Identifier> {
//!     key.parse()
//! }
//!
//! assert!(parse("app:settings/theme").is_ok());
//! assert!(matches!(parse("no-separator"), Err(ProtocolError::InvalidIdentifier(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Handshake errors
    pub const ERR_META_MISSING: &str = "Connection closed before receiving server meta";
    pub const ERR_META_NOT_FIRST: &str = "First packet received was not server meta";
    pub const ERR_NO_TOKEN: &str = "No token stored for this address and app";
    pub const ERR_UNSUPPORTED_ENCRYPTION: &str = "Unsupported encryption kind";
    pub const ERR_MISSING_MATERIAL: &str = "Connect packet carries no encryption material";

    /// Engine state errors
    pub const ERR_ALREADY_CONNECTING: &str = "Cannot connect while already connecting";
    pub const ERR_ALREADY_READY: &str = "Received READY packet when already ready";
    pub const ERR_TASK_AFTER_START: &str = "Cannot add task after the session has started";
    pub const ERR_BIND_AFTER_START: &str = "Cannot bind endpoints after the session has started";
    pub const ERR_CONNECTION_WHILE_ACTIVE: &str = "Cannot change connection while connected";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";

    /// Codec errors
    pub const ERR_ULEB128_OVERFLOW: &str = "ULEB128 value exceeds 64 bits";
    pub const ERR_FLAGS_TOO_LONG: &str = "Flag sets hold at most 64 bits";
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Decode error: need {needed} bytes, {remaining} remaining")]
    DecodeError { needed: usize, remaining: usize },

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Buffer not fully read: {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Packet type {0} not registered")]
    UnregisteredPacket(String),

    #[error("Received invocation for unknown endpoint {0}")]
    UnknownEndpoint(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Another connection replaced this session: {0}")]
    AnotherConnection(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No connection established")]
    NotConnected,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectLimit(u32),

    #[error("Endpoint error: {0}")]
    EndpointError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether a session that ended with this error may be retried.
    ///
    /// Transport-level failures are transient; everything the peer or the
    /// local protocol layer rejected is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::InternalError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
