//! # Transport Layer
//!
//! Pluggable byte transports carrying [`Envelope`]s.
//!
//! The engine never touches sockets directly. A [`Transport`] knows how to
//! open a connection to the server; the resulting [`Connection`] moves whole
//! envelopes in both directions and reports closure as `Ok(None)` from
//! `receive`.
//!
//! ## Implementations
//! - **Memory**: in-process duplex channel pair (tests, embedding)
//! - **Local**: length-framed envelopes over TCP and Unix domain sockets
//!
//! Both traits return boxed futures so they stay object safe; the engine
//! holds them as `Arc<dyn Transport>` / `Arc<dyn Connection>`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::core::packet::Envelope;
use crate::error::Result;

pub mod local;
pub mod memory;

/// An established, bidirectional envelope stream.
pub trait Connection: Send + Sync {
    fn send(&self, envelope: Envelope) -> BoxFuture<'_, Result<()>>;

    /// Next envelope, or `Ok(None)` once the peer has closed the stream.
    fn receive(&self) -> BoxFuture<'_, Result<Option<Envelope>>>;

    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;
}

/// Opens connections to a server.
pub trait Transport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>>;
}
