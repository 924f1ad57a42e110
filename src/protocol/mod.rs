//! # Protocol Layer
//!
//! Typed packets on top of [`Envelope`](crate::core::packet::Envelope)s.
//!
//! ## Components
//! - **Packet**: packet types, the type-erased [`Packet`](packet::Packet) and the mapper
//! - **Packets**: core session packets (`server_meta`, `connect`, `disconnect`, `token`, `ready`)
//! - **Dispatcher**: ordered handler sets per packet type
//! - **Handshake**: X25519 key agreement and XChaCha20-Poly1305 session encryption
//!
//! ## Session Handshake
//! ```text
//! server -> server_meta {protocol, hash, encryption?}
//! client -> connect {app, protocol, token | encryption}
//! client -> (startup tasks) -> ready
//! server -> ready
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod packet;
pub mod packets;
