//! In-process transport.
//!
//! A [`MemoryConnection`] pair is two unbounded channels sharing one close
//! signal, so closing either end closes both, like a socket. Envelopes
//! already queued are still delivered before `receive` reports closure.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::packet::Envelope;
use crate::error::{ProtocolError, Result};
use crate::transport::{Connection, Transport};

pub struct MemoryConnection {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Two connected ends.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            MemoryConnection {
                tx: a_tx,
                rx: Mutex::new(b_rx),
                closed: closed.clone(),
            },
            MemoryConnection {
                tx: b_tx,
                rx: Mutex::new(a_rx),
                closed,
            },
        )
    }

    async fn send_inner(&self, envelope: Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.tx
            .send(envelope)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn receive_inner(&self) -> Result<Option<Envelope>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            envelope = rx.recv() => Ok(envelope),
            _ = self.closed.cancelled() => Ok(rx.try_recv().ok()),
        }
    }
}

impl Connection for MemoryConnection {
    fn send(&self, envelope: Envelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(envelope))
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<Envelope>>> {
        Box::pin(self.receive_inner())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.cancel();
        Box::pin(async {})
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Client side: each `connect` hands the server end to the paired listener.
#[derive(Clone)]
pub struct MemoryTransport {
    incoming: mpsc::UnboundedSender<MemoryConnection>,
}

/// Server side of a [`MemoryTransport`].
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryTransport {
    pub fn new() -> (MemoryTransport, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { incoming: tx },
            MemoryListener { incoming: rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let (client, server) = MemoryConnection::pair();
            self.incoming.send(server).map_err(|_| {
                ProtocolError::TransportError("memory listener is gone".to_string())
            })?;
            debug!("Memory connection established");
            Ok(Arc::new(client) as Arc<dyn Connection>)
        })
    }
}

impl MemoryListener {
    /// Next incoming connection; `None` once every transport is dropped.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.recv().await
    }
}
