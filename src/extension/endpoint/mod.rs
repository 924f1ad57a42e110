//! # Endpoint Extension
//!
//! Remote calls routed through the broker:
//!
//! ```text
//! caller --invoke--> broker --invoked--> handler
//! caller <-response- broker <-response-- handler
//! ```
//!
//! Calls are correlated by a per-client key. Handlers are bound before the
//! session starts and advertised in one register packet on every connect.

pub mod packets;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::identifier::Identifier;
use crate::core::serialization::{Json, Serializer};
use crate::error::{constants, ProtocolError, Result};
use crate::network::engine::{in_session_setup, Network};

use self::packets::{
    EndpointInvokePacket, EndpointInvokedPacket, EndpointRegisterPacket, EndpointResponsePacket,
    INVOKE, INVOKED, REGISTER, RESPONSE,
};

/// Identifier plus request and response serializers.
pub struct EndpointType<Req, Res> {
    id: Identifier,
    request: Arc<dyn Serializer<Req>>,
    response: Arc<dyn Serializer<Res>>,
    permission: Option<Identifier>,
}

impl<Req, Res> Clone for EndpointType<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            request: Arc::clone(&self.request),
            response: Arc::clone(&self.response),
            permission: self.permission.clone(),
        }
    }
}

impl<Req, Res> std::fmt::Debug for EndpointType<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointType")
            .field("id", &self.id)
            .field("permission", &self.permission)
            .finish()
    }
}

impl<Req: 'static, Res: 'static> EndpointType<Req, Res> {
    pub fn new(
        id: Identifier,
        request: impl Serializer<Req>,
        response: impl Serializer<Res>,
    ) -> Self {
        Self {
            id,
            request: Arc::new(request),
            response: Arc::new(response),
            permission: None,
        }
    }

    /// Permission the broker checks before routing calls here.
    pub fn with_permission(mut self, permission: Identifier) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn permission(&self) -> Option<&Identifier> {
        self.permission.as_ref()
    }
}

impl<Req, Res> EndpointType<Req, Res>
where
    Req: Serialize + DeserializeOwned + 'static,
    Res: Serialize + DeserializeOwned + 'static,
{
    pub fn json(id: Identifier) -> Self {
        Self::new(id, Json::new(), Json::new())
    }
}

/// Who invoked a bound endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub id: Identifier,
    pub caller: Identifier,
    pub key: u64,
}

type Handler = Arc<dyn Fn(Bytes, Invocation) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

struct Bound {
    permission: Option<Identifier>,
    handler: Handler,
}

struct Inner {
    network: Network,
    bound: Mutex<HashMap<Identifier, Bound>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>,
    next_key: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a call's correlation entry when the call future is dropped.
struct PendingCall<'a> {
    inner: &'a Inner,
    key: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.key);
    }
}

#[derive(Clone)]
pub struct EndpointExtension {
    inner: Arc<Inner>,
}

impl EndpointExtension {
    pub fn new(network: &Network) -> Result<Self> {
        // wall-clock seed keeps keys distinct across restarts of one app
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or_default();
        let extension = Self {
            inner: Arc::new(Inner {
                network: network.clone(),
                bound: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(seed),
            }),
        };

        network.register_packet(&REGISTER)?;
        network.register_packet(&INVOKE)?;
        network.register_packet(&INVOKED)?;
        network.register_packet(&RESPONSE)?;

        let weak = Arc::downgrade(&extension.inner);
        network.add_packet_handler(&INVOKED, move |packet| {
            futures::future::ready(with_inner(&weak, |inner| inner.handle_invoked(&packet)))
        })?;

        let weak = Arc::downgrade(&extension.inner);
        network.add_packet_handler(&RESPONSE, move |packet| {
            futures::future::ready(with_inner(&weak, |inner| {
                inner.handle_response(&packet);
                Ok(())
            }))
        })?;

        let weak = Arc::downgrade(&extension.inner);
        network.add_task(move || {
            futures::future::ready(with_inner(&weak, Inner::advertise))
        })?;

        let weak = Arc::downgrade(&extension.inner);
        network.on_disconnected(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.reject_pending();
            }
            futures::future::ready(Ok(()))
        });

        Ok(extension)
    }

    /// Serve `endpoint` with `handler`. Only allowed before the session starts.
    pub fn bind<Req, Res, F, Fut>(&self, endpoint: &EndpointType<Req, Res>, handler: F) -> Result<()>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Req, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        if self.inner.network.is_started() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_BIND_AFTER_START.into(),
            ));
        }
        let mut bound = lock(&self.inner.bound);
        if bound.contains_key(endpoint.id()) {
            return Err(ProtocolError::DuplicateRegistration(endpoint.id().key()));
        }

        let request = Arc::clone(&endpoint.request);
        let response = Arc::clone(&endpoint.response);
        let handler: Handler = Arc::new(move |payload: Bytes, invocation: Invocation| {
            let call = request
                .deserialize(&payload)
                .map(|value| handler(value, invocation));
            let response = Arc::clone(&response);
            async move {
                let value = call?.await?;
                response.serialize(&value)
            }
            .boxed()
        });
        bound.insert(
            endpoint.id().clone(),
            Bound {
                permission: endpoint.permission.clone(),
                handler,
            },
        );
        debug!(endpoint = %endpoint.id(), "Bound endpoint");
        Ok(())
    }

    pub fn is_bound(&self, id: &Identifier) -> bool {
        lock(&self.inner.bound).contains_key(id)
    }

    /// Invoke a remote endpoint and wait for its response.
    ///
    /// Outside a startup task or ready listener the call first waits for the
    /// session to be ready and for its ready listeners to finish. A disconnect while waiting for the response fails the call
    /// with [`ProtocolError::ConnectionClosed`].
    pub async fn call<Req, Res>(&self, endpoint: &EndpointType<Req, Res>, request: &Req) -> Result<Res>
    where
        Req: 'static,
        Res: 'static,
    {
        let network = &self.inner.network;
        if !in_session_setup() {
            network.wait_ready().await?;
        }
        let payload = endpoint.request.serialize(request)?;
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(key, tx);
        let _pending = PendingCall {
            inner: &self.inner,
            key,
        };

        network.send(
            &INVOKE,
            &EndpointInvokePacket {
                id: endpoint.id().clone(),
                key,
                payload,
            },
        )?;
        network.metrics().call_issued();
        debug!(endpoint = %endpoint.id(), key, "Invoked endpoint");

        let result = rx
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
            .and_then(|response| response)
            .and_then(|bytes| endpoint.response.deserialize(&bytes));
        if result.is_err() {
            network.metrics().call_failed();
        }
        result
    }
}

fn with_inner<R>(weak: &Weak<Inner>, f: impl FnOnce(&Arc<Inner>) -> Result<R>) -> Result<R>
where
    R: Default,
{
    match weak.upgrade() {
        Some(inner) => f(&inner),
        None => Ok(R::default()),
    }
}

impl Inner {
    fn advertise(self: &Arc<Self>) -> Result<()> {
        let mut endpoints: Vec<(Identifier, Option<Identifier>)> = lock(&self.bound)
            .iter()
            .map(|(id, bound)| (id.clone(), bound.permission.clone()))
            .collect();
        endpoints.sort();
        debug!(count = endpoints.len(), "Advertising endpoints");
        self.network
            .send(&REGISTER, &EndpointRegisterPacket { endpoints })
    }

    fn handle_invoked(self: &Arc<Self>, packet: &EndpointInvokedPacket) -> Result<()> {
        let handler = lock(&self.bound)
            .get(&packet.id)
            .map(|bound| Arc::clone(&bound.handler))
            .ok_or_else(|| ProtocolError::UnknownEndpoint(packet.id.key()))?;

        let invocation = Invocation {
            id: packet.id.clone(),
            caller: packet.caller.clone(),
            key: packet.key,
        };
        let payload = packet.payload.clone();
        let network = self.network.clone();

        // handlers may call other endpoints, so they run off the receive loop
        tokio::spawn(async move {
            let id = invocation.id.clone();
            let key = invocation.key;
            let outcome = AssertUnwindSafe(handler(payload, invocation))
                .catch_unwind()
                .await;
            let response = match outcome {
                Ok(Ok(bytes)) => EndpointResponsePacket::ok(id, key, bytes),
                Ok(Err(e)) => {
                    warn!(endpoint = %id, error = %e, "Endpoint handler failed");
                    let message = match e {
                        ProtocolError::EndpointError(message) => message,
                        other => other.to_string(),
                    };
                    EndpointResponsePacket::err(id, key, message)
                }
                Err(_) => {
                    warn!(endpoint = %id, "Endpoint handler panicked");
                    EndpointResponsePacket::err(id, key, "endpoint handler panicked")
                }
            };
            if let Err(e) = network.send(&RESPONSE, &response) {
                warn!(error = %e, "Failed to send endpoint response");
            }
        });
        Ok(())
    }

    fn handle_response(&self, packet: &EndpointResponsePacket) {
        let Some(tx) = lock(&self.pending).remove(&packet.key) else {
            warn!(endpoint = %packet.id, key = packet.key, "Response for unknown call");
            return;
        };
        let result = match &packet.error {
            Some(error) => Err(ProtocolError::EndpointError(error.clone())),
            None => Ok(packet.payload.clone()),
        };
        // receiver gone means the caller stopped waiting
        let _ = tx.send(result);
    }

    fn reject_pending(&self) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Rejecting pending calls");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed));
        }
    }
}

impl std::fmt::Debug for EndpointExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointExtension")
            .field("bound", &lock(&self.inner.bound).len())
            .field("pending", &lock(&self.inner.pending).len())
            .finish()
    }
}
