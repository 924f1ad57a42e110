//! # brokerlink
//!
//! Client-side session engine for a broker-mediated application integration
//! protocol. Applications connect to a shared broker, exchange typed packets,
//! call each other's endpoints and share registers.
//!
//! ## Layers
//! - [`core`](crate::core): identifiers, the ULEB128 byte codec, payload serializers, envelope framing
//! - [`protocol`]: packet types, mapper, dispatcher, core packets, session encryption
//! - [`transport`]: object-safe transports (in-memory, TCP, Unix sockets)
//! - [`network`]: the connection engine, token storage, status and reconnect backoff
//! - [`extension`]: endpoint calls and registries built on the engine
//! - [`client`]: a ready-wired [`Client`]
//!
//! ## Ambient
//! - [`config`]: TOML and environment configuration
//! - [`utils`]: logging setup, metrics, timeouts, AEAD primitives

pub mod app;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod extension;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use app::{App, AppType};
pub use client::{Client, ClientBuilder};
pub use config::NetworkConfig;
pub use crate::core::identifier::Identifier;
pub use error::{ProtocolError, Result};
pub use network::{Address, Network, NetworkStatus};
