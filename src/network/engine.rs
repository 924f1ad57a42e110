//! # Connection Engine
//!
//! Owns at most one session with the broker and drives it through its
//! lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Ready
//!       ^                                      |
//!       +---- Reconnecting <-- (retryable end) +
//! ```
//!
//! ## Session Setup
//! 1. Obtain a connection (a pending one from `set_connection`, else the transport)
//! 2. Receive the server meta packet; anything else first is a protocol fault
//! 3. Look up the token for `(address, app)`; none is fatal
//! 4. Negotiate encryption when offered and wanted
//! 5. Send the connect packet (always plaintext)
//! 6. Start the receive loop, emit `connected`, run startup tasks in order
//! 7. Send ready; the server's ready packet moves the status to `Ready`
//!
//! ## Session End
//! `ServerRestart`, `InternalError`, transport failures and a silently closed
//! stream are retried with exponential backoff. `Shutdown`, `Close`, a local
//! `close()` and a cancelled backoff end `connect` with `Ok`. Every other
//! reason ends it with the matching typed error.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::app::App;
use crate::config::NetworkConfig;
use crate::core::packet::Envelope;
use crate::error::{constants, ProtocolError, Result};
use crate::event::{EventEmitter, ListenerId};
use crate::network::address::Address;
use crate::network::status::{reconnect_delay, NetworkStatus, ReconnectHandle, SessionEnd};
use crate::network::token::TokenProvider;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{client_encryption_init, SessionCipher};
use crate::protocol::packet::{Packet, PacketMapper, PacketType};
use crate::protocol::packets::{
    ConnectPacket, DisconnectPacket, ProtocolInfo, CONNECT, DISCONNECT, READY, SERVER_META, TOKEN,
};
use crate::transport::{Connection, Transport};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;

tokio::task_local! {
    static SESSION_SETUP: ();
}

/// True while running inside a startup task or a ready listener.
///
/// Endpoint calls made here skip the wait for the ready gate.
pub fn in_session_setup() -> bool {
    SESSION_SETUP.try_with(|_| ()).is_ok()
}

type Task = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Lifecycle events, each delivered to listeners in registration order.
#[derive(Debug, Default)]
pub struct NetworkEvents {
    pub connected: EventEmitter<()>,
    pub ready: EventEmitter<()>,
    pub disconnected: EventEmitter<Option<DisconnectPacket>>,
    pub status: EventEmitter<NetworkStatus>,
    pub packet: EventEmitter<Packet>,
}

struct Session {
    connection: Arc<dyn Connection>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

struct Inner {
    app: App,
    address: Mutex<Address>,
    transport: Arc<dyn Transport>,
    token_provider: Arc<dyn TokenProvider>,
    config: NetworkConfig,
    mapper: PacketMapper,
    dispatcher: Dispatcher,
    events: NetworkEvents,
    tasks: Mutex<Vec<Task>>,
    status: watch::Sender<NetworkStatus>,
    /// Open once every ready listener of the current session has returned
    ready_gate: watch::Sender<bool>,
    ready_listeners: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<Option<Session>>,
    pending_connection: Mutex<Option<Arc<dyn Connection>>>,
    shutdown: Mutex<CancellationToken>,
    started: AtomicBool,
    connecting: AtomicBool,
    attempt: AtomicU32,
    metrics: Metrics,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the connection engine. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

/// Clears the connecting flag however `connect` exits.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Network {
    pub fn new(
        app: App,
        address: Address,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
        config: NetworkConfig,
    ) -> Result<Self> {
        let (status, _) = watch::channel(NetworkStatus::default());
        let (ready_gate, _) = watch::channel(false);
        let network = Self {
            inner: Arc::new(Inner {
                app,
                address: Mutex::new(address),
                transport,
                token_provider,
                config,
                mapper: PacketMapper::new(),
                dispatcher: Dispatcher::new(),
                events: NetworkEvents::default(),
                tasks: Mutex::new(Vec::new()),
                status,
                ready_gate,
                ready_listeners: Mutex::new(None),
                session: Mutex::new(None),
                pending_connection: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                started: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                metrics: Metrics::new(),
            }),
        };

        network.register_packet(&SERVER_META)?;
        network.register_packet(&CONNECT)?;
        network.register_packet(&DISCONNECT)?;
        network.register_packet(&TOKEN)?;
        network.register_packet(&READY)?;

        let weak = Arc::downgrade(&network.inner);
        network.add_packet_handler(&TOKEN, move |token: Arc<String>| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let address = lock(&inner.address).clone();
                inner
                    .token_provider
                    .set(&address, &inner.app, (*token).clone())
                    .await?;
                debug!("Stored refreshed token");
                Ok(())
            }
        })?;

        let weak = Arc::downgrade(&network.inner);
        network.add_packet_handler(&READY, move |_: Arc<()>| {
            let result = match weak.upgrade() {
                Some(inner) => Network { inner }.on_server_ready(),
                None => Ok(()),
            };
            futures::future::ready(result)
        })?;

        Ok(network)
    }

    pub fn app(&self) -> &App {
        &self.inner.app
    }

    /// Broker address, including the hash from the latest server meta.
    pub fn address(&self) -> Address {
        lock(&self.inner.address).clone()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn events(&self) -> &NetworkEvents {
        &self.inner.events
    }

    pub fn status(&self) -> NetworkStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.status.borrow().is_ready()
    }

    /// True once `connect` has been called.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Watch status changes without registering a listener.
    pub fn subscribe_status(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }

    /// Status changes as a stream, starting with the current status.
    pub fn status_stream(&self) -> WatchStream<NetworkStatus> {
        WatchStream::new(self.inner.status.subscribe())
    }

    /// Wait until the session is `Ready` and its ready listeners have run.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready_gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn register_packet<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>) -> Result<()> {
        self.inner.mapper.register(packet_type)?;
        self.inner.dispatcher.register(packet_type.id())
    }

    /// Attach a typed handler to a registered packet type.
    pub fn add_packet_handler<T, F, Fut>(&self, packet_type: &PacketType<T>, handler: F) -> Result<ListenerId>
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let typed = packet_type.clone();
        self.inner.dispatcher.add_handler(packet_type.id(), move |packet: Packet| {
            let future = packet.downcast(&typed).map(&handler);
            let id = packet.id.clone();
            async move {
                match future {
                    Some(future) => future.await,
                    None => Err(ProtocolError::InvalidState(format!(
                        "packet {id} does not carry the registered type"
                    ))),
                }
            }
        })
    }

    /// Register work to run after `connected` and before ready, every session.
    pub fn add_task<F, Fut>(&self, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_started() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_TASK_AFTER_START.into(),
            ));
        }
        lock(&self.inner.tasks).push(Arc::new(move || task().boxed()));
        Ok(())
    }

    /// Use `connection` for the next session instead of dialing the transport.
    pub fn set_connection(&self, connection: Arc<dyn Connection>) -> Result<()> {
        if !self.inner.status.borrow().is_disconnected() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_CONNECTION_WHILE_ACTIVE.into(),
            ));
        }
        *lock(&self.inner.pending_connection) = Some(connection);
        Ok(())
    }

    /// Queue a packet for the current session.
    pub fn send<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>, value: &T) -> Result<()> {
        let envelope = self.inner.mapper.serialize(packet_type, value)?;
        let size = envelope.wire_len() as u64;
        let session = lock(&self.inner.session);
        let session = session.as_ref().ok_or(ProtocolError::NotConnected)?;
        session
            .outbound
            .send(envelope)
            .map_err(|_| ProtocolError::NotConnected)?;
        self.inner.metrics.packet_sent(size);
        Ok(())
    }

    pub fn on_connected<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.events.connected.listen(listener)
    }

    pub fn on_ready<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.events.ready.listen(listener)
    }

    pub fn on_disconnected<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<DisconnectPacket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.events.disconnected.listen(listener)
    }

    pub fn on_status<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(NetworkStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.events.status.listen(listener)
    }

    pub fn on_packet<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.events.packet.listen(listener)
    }

    /// End the session and stop reconnecting. `connect` returns `Ok`.
    pub async fn close(&self) {
        lock(&self.inner.shutdown).cancel();
        let connection = lock(&self.inner.session)
            .as_ref()
            .map(|session| Arc::clone(&session.connection));
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!("Network close requested");
    }

    async fn set_status(&self, status: NetworkStatus) {
        debug!(status = %status.kind(), "Status changed");
        self.inner.status.send_replace(status.clone());
        if let Err(e) = self.inner.events.status.emit(status).await {
            warn!(error = %e, "Status listener failed");
        }
    }

    fn on_server_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Err(ProtocolError::UnexpectedMessage(
                constants::ERR_ALREADY_READY.into(),
            ));
        }
        self.inner.status.send_replace(NetworkStatus::Ready);
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.inner.metrics.handshake_success();
        info!("Session ready");

        // listeners may await endpoint calls, which need the receive loop
        let network = self.clone();
        let listeners = tokio::spawn(SESSION_SETUP.scope((), async move {
            let events = &network.inner.events;
            if let Err(e) = events.status.emit(NetworkStatus::Ready).await {
                warn!(error = %e, "Status listener failed");
            }
            if let Err(e) = events.ready.emit(()).await {
                warn!(error = %e, "Ready listener failed");
            }
            if network.is_ready() {
                network.inner.ready_gate.send_replace(true);
                debug!("Ready listeners finished");
            }
        }));
        *lock(&self.inner.ready_listeners) = Some(listeners);
        Ok(())
    }

    /// Close the ready gate, cancelling ready listeners still running.
    async fn close_ready_gate(&self) {
        let listeners = lock(&self.inner.ready_listeners).take();
        if let Some(listeners) = listeners {
            if !listeners.is_finished() {
                debug!("Cancelling ready listeners of the ended session");
                listeners.abort();
            }
            let _ = listeners.await;
        }
        self.inner.ready_gate.send_replace(false);
    }

    /// Run sessions until a terminal end.
    ///
    /// With `reconnect`, retryable endings schedule another attempt after
    /// the backoff delay; without it they are returned as errors.
    #[instrument(skip(self), fields(app = %self.inner.app.id))]
    pub async fn connect(&self, reconnect: bool) -> Result<()> {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_CONNECTING.into(),
            ));
        }
        let _guard = ConnectingGuard(&self.inner.connecting);
        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.attempt.store(0, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        *lock(&self.inner.shutdown) = shutdown.clone();

        loop {
            let end = self.run_session(&shutdown).await;
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let error = match end {
                SessionEnd::Closed(reason) => {
                    info!(reason = ?reason.map(|r| r.kind), "Session closed");
                    return Ok(());
                }
                SessionEnd::Fatal { error, .. } => {
                    error!(error = %error, "Session failed");
                    self.inner.metrics.protocol_error();
                    return Err(error);
                }
                SessionEnd::Retry { error, .. } => error,
            };

            if !reconnect {
                return Err(error);
            }
            let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst);
            let limit = self.inner.config.client.max_reconnect_attempts;
            if limit > 0 && attempt >= limit {
                warn!(attempts = attempt, "Reconnect limit reached");
                return Err(ProtocolError::ReconnectLimit(attempt));
            }
            warn!(error = %error, attempt, "Session ended, scheduling reconnect");
            if !self.schedule_reconnect(attempt, &shutdown).await {
                return Ok(());
            }
        }
    }

    /// Wait out the backoff. Returns false when cancelled.
    async fn schedule_reconnect(&self, attempt: u32, shutdown: &CancellationToken) -> bool {
        let client = &self.inner.config.client;
        let delay = reconnect_delay(attempt, client.reconnect_delay, client.max_reconnect_delay);
        let deadline = Instant::now() + delay;
        let handle = ReconnectHandle::new(shutdown.child_token());
        self.inner.metrics.reconnect_attempt();

        self.set_status(NetworkStatus::Reconnecting {
            attempt,
            delay,
            deadline,
            handle: handle.clone(),
        })
        .await;

        let proceed = !handle.is_cancelled()
            && tokio::select! {
                _ = tokio::time::sleep_until(deadline) => true,
                _ = handle.cancelled() => false,
            };
        if !proceed {
            info!(attempt, "Reconnect cancelled");
            self.set_status(NetworkStatus::Disconnected {
                attempt: Some(attempt),
                reason: None,
            })
            .await;
        }
        proceed
    }

    async fn open_connection(&self) -> Result<Arc<dyn Connection>> {
        let pending = lock(&self.inner.pending_connection).take();
        match pending {
            Some(connection) => Ok(connection),
            None => {
                with_timeout_error(
                    self.inner.transport.connect(),
                    self.inner.config.client.connection_timeout,
                )
                .await
            }
        }
    }

    async fn run_session(&self, shutdown: &CancellationToken) -> SessionEnd {
        let connection = tokio::select! {
            result = self.open_connection() => match result {
                Ok(connection) => connection,
                Err(e) => {
                    self.inner.metrics.connection_error();
                    return SessionEnd::from_error(e);
                }
            },
            _ = shutdown.cancelled() => return SessionEnd::Closed(None),
        };
        self.inner.metrics.connection_established();
        self.inner.metrics.handshake_attempt();

        let end = self.serve(Arc::clone(&connection), shutdown).await;
        if !matches!(self.status(), NetworkStatus::Ready) {
            self.inner.metrics.handshake_failed();
        }
        self.teardown(&connection, &end).await;
        end
    }

    async fn teardown(&self, connection: &Arc<dyn Connection>, end: &SessionEnd) {
        *lock(&self.inner.session) = None;
        connection.close().await;
        self.inner.metrics.connection_closed();
        self.close_ready_gate().await;

        let reason = end.reason().cloned();
        self.set_status(NetworkStatus::Disconnected {
            attempt: Some(self.inner.attempt.load(Ordering::SeqCst)),
            reason: reason.clone(),
        })
        .await;
        if let Err(e) = self.inner.events.disconnected.emit(reason).await {
            warn!(error = %e, "Disconnect listener failed");
        }
        self.inner.metrics.log_metrics();
    }

    async fn serve(&self, connection: Arc<dyn Connection>, shutdown: &CancellationToken) -> SessionEnd {
        let _timer = Timer::start("session");
        self.set_status(NetworkStatus::Connecting).await;

        let first = tokio::select! {
            result = with_timeout_error(connection.receive(), self.inner.config.client.connection_timeout) => result,
            _ = shutdown.cancelled() => return SessionEnd::Closed(None),
        };
        let meta = match first {
            Ok(Some(envelope)) if envelope.kind == SERVER_META.id().key() => {
                match self.inner.mapper.deserialize(&envelope) {
                    Ok(packet) => match packet.downcast(&SERVER_META) {
                        Some(meta) => meta,
                        None => return SessionEnd::from_error(invalid_packet(constants::ERR_META_NOT_FIRST)),
                    },
                    Err(e) => return SessionEnd::from_error(invalid_packet(e)),
                }
            }
            Ok(Some(_)) => return SessionEnd::from_error(invalid_packet(constants::ERR_META_NOT_FIRST)),
            Ok(None) => return SessionEnd::from_error(invalid_packet(constants::ERR_META_MISSING)),
            Err(e) => return SessionEnd::from_error(e),
        };

        let address = {
            let mut address = lock(&self.inner.address);
            address.hash = meta.hash.clone();
            address.clone()
        };
        let token = match self.inner.token_provider.get(&address, &self.inner.app).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return SessionEnd::from_error(ProtocolError::InvalidToken(
                    constants::ERR_NO_TOKEN.into(),
                ))
            }
            Err(e) => return SessionEnd::from_error(e),
        };

        let mut connect = ConnectPacket {
            app: self.inner.app.clone(),
            protocol: ProtocolInfo::default(),
            token: Some(token),
            encryption: None,
        };
        let mut cipher = None;
        let wants_encryption =
            self.inner.app.is_remote() || self.inner.config.transport.encryption_enabled;
        if let (Some(descriptor), true) = (&meta.encryption, wants_encryption) {
            match client_encryption_init(descriptor, connect.token.as_deref()) {
                Ok((session_cipher, material)) => {
                    connect.token = None;
                    connect.encryption = Some(material);
                    cipher = Some(Arc::new(session_cipher));
                    info!("Session encryption negotiated");
                }
                Err(e) => return SessionEnd::from_error(e),
            }
        }

        let sent = match self.inner.mapper.serialize(&CONNECT, &connect) {
            Ok(envelope) => connection.send(envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            return SessionEnd::from_error(e);
        }

        let (outbound, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.session) = Some(Session {
            connection: Arc::clone(&connection),
            outbound,
        });
        tokio::spawn(write_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&connection),
            cipher.clone(),
            rx,
        ));
        let mut receiver = tokio::spawn(receive_loop(
            self.clone(),
            Arc::clone(&connection),
            cipher,
            shutdown.clone(),
        ));

        self.set_status(NetworkStatus::Connected).await;
        info!(hash = ?address.hash, "Connected");
        if let Err(e) = self.inner.events.connected.emit(()).await {
            warn!(error = %e, "Connected listener failed");
        }

        tokio::select! {
            joined = &mut receiver => return join_end(joined),
            result = self.run_tasks() => {
                if let Err(e) = result.and_then(|_| self.send(&READY, &())) {
                    connection.close().await;
                    receiver.abort();
                    return SessionEnd::from_error(e);
                }
            }
        }

        join_end(receiver.await)
    }

    async fn run_tasks(&self) -> Result<()> {
        let tasks: Vec<Task> = lock(&self.inner.tasks).clone();
        for task in tasks {
            SESSION_SETUP.scope((), task()).await?;
        }
        Ok(())
    }
}

fn invalid_packet(message: impl ToString) -> ProtocolError {
    ProtocolError::InvalidPacket(message.to_string())
}

fn join_end(joined: std::result::Result<SessionEnd, tokio::task::JoinError>) -> SessionEnd {
    joined.unwrap_or_else(|e| {
        SessionEnd::from_error(ProtocolError::InvalidState(format!(
            "receive loop stopped unexpectedly: {e}"
        )))
    })
}

/// Drains the outbound queue in FIFO order, sealing envelopes when encrypted.
async fn write_loop(
    inner: Weak<Inner>,
    connection: Arc<dyn Connection>,
    cipher: Option<Arc<SessionCipher>>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let envelope = match &cipher {
            Some(cipher) => match cipher.encrypt(&envelope) {
                Ok(sealed) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.metrics.encryption();
                    }
                    sealed
                }
                Err(e) => {
                    error!(error = %e, "Failed to encrypt outbound packet");
                    connection.close().await;
                    break;
                }
            },
            None => envelope,
        };
        if let Err(e) = connection.send(envelope).await {
            debug!(error = %e, "Send failed, closing connection");
            connection.close().await;
            break;
        }
    }
}

async fn receive_loop(
    network: Network,
    connection: Arc<dyn Connection>,
    cipher: Option<Arc<SessionCipher>>,
    shutdown: CancellationToken,
) -> SessionEnd {
    loop {
        let received = tokio::select! {
            result = connection.receive() => result,
            _ = shutdown.cancelled() => return SessionEnd::Closed(None),
        };
        let envelope = match received {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                if shutdown.is_cancelled() {
                    return SessionEnd::Closed(None);
                }
                debug!("Stream closed without disconnect packet");
                return SessionEnd::from_error(ProtocolError::ConnectionClosed);
            }
            Err(e) => return SessionEnd::from_error(e),
        };
        network.inner.metrics.packet_received(envelope.wire_len() as u64);

        let envelope = match &cipher {
            Some(cipher) => {
                network.inner.metrics.decryption();
                match cipher.decrypt(&envelope) {
                    Ok(plain) => plain,
                    Err(e) => return SessionEnd::from_error(e),
                }
            }
            None => envelope,
        };

        let packet = match network.inner.mapper.deserialize(&envelope) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Undecodable packet");
                return SessionEnd::from_error(invalid_packet(e));
            }
        };

        if let Some(reason) = packet.downcast(&DISCONNECT) {
            info!(reason = %reason.kind, message = ?reason.message, "Server disconnected");
            return SessionEnd::from_disconnect((*reason).clone());
        }

        if let Err(e) = network.inner.events.packet.emit(packet.clone()).await {
            warn!(kind = %packet.id, error = %e, "Packet listener failed");
        }
        if let Err(e) = network.inner.dispatcher.dispatch(packet).await {
            warn!(error = %e, "Packet handler failed");
            return SessionEnd::from_error(e);
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("app", &self.inner.app.id)
            .field("status", &self.status().kind())
            .finish()
    }
}
