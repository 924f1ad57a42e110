use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::codec::EnvelopeCodec;
use crate::core::packet::Envelope;
use crate::error::{ProtocolError, Result};
use crate::transport::{Connection, Transport};

/// Envelope connection over any byte stream, framed with [`EnvelopeCodec`].
///
/// The framed stream is split so that one task can block in `receive` while
/// others send.
pub struct StreamConnection<S> {
    sink: Mutex<SplitSink<Framed<S, EnvelopeCodec>, Envelope>>,
    stream: Mutex<SplitStream<Framed<S, EnvelopeCodec>>>,
    closed: CancellationToken,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: S, codec: EnvelopeCodec) -> Self {
        let (sink, stream) = Framed::new(io, codec).split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }

    async fn send_inner(&self, envelope: Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.sink.lock().await.send(envelope).await
    }

    async fn receive_inner(&self) -> Result<Option<Envelope>> {
        let mut stream = self.stream.lock().await;
        tokio::select! {
            next = stream.next() => next.transpose(),
            _ = self.closed.cancelled() => Ok(None),
        }
    }

    async fn close_inner(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "Error while closing stream");
        }
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn send(&self, envelope: Envelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(envelope))
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<Envelope>>> {
        Box::pin(self.receive_inner())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    codec: EnvelopeCodec,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, max_frame: usize) -> Self {
        Self {
            addr: addr.into(),
            codec: EnvelopeCodec::new(max_frame),
        }
    }

    #[instrument(skip(self), fields(address = %self.addr))]
    async fn open(&self) -> Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            ProtocolError::TransportError(format!("connect to {} failed: {e}", self.addr))
        })?;
        stream.set_nodelay(true)?;
        let peer: Option<SocketAddr> = stream.peer_addr().ok();
        info!(peer = ?peer, "TCP connection established");
        Ok(Arc::new(StreamConnection::new(stream, self.codec)))
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(self.open())
    }
}

/// Connects to a Unix domain socket.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
    codec: EnvelopeCodec,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>, max_frame: usize) -> Self {
        Self {
            path: path.into(),
            codec: EnvelopeCodec::new(max_frame),
        }
    }

    #[instrument(skip(self), fields(socket_path = %self.path.display()))]
    async fn open(&self) -> Result<Arc<dyn Connection>> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            ProtocolError::TransportError(format!(
                "connect to {} failed: {e}",
                self.path.display()
            ))
        })?;
        info!("Unix socket connection established");
        Ok(Arc::new(StreamConnection::new(stream, self.codec)))
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(self.open())
    }
}
