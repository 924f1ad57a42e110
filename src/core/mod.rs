//! # Core Protocol Components
//!
//! Identifiers, binary buffers, payload serializers and stream framing.
//!
//! ## Components
//! - **Identifier**: namespaced keys for every typed channel
//! - **ByteBuffer**: ULEB128-based binary writer/reader with flag sets
//! - **Serialization**: JSON, binary and raw payload encodings
//! - **Packet**: the `Envelope` exchanged over a connection
//! - **Codec**: Tokio codec for framing envelopes over byte streams
//!
//! ## Wire Format
//! ```text
//! [uleb128 frame len] [uleb128 len][type key] [uleb128 len][payload]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation
//! - Decoders reject truncated input and trailing bytes

pub mod bytebuffer;
pub mod codec;
pub mod identifier;
pub mod packet;
pub mod serialization;
