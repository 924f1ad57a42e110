//! # Registry Extension
//!
//! Shared single-value registers kept by the broker.
//!
//! Each [`Registry`] serializes its own get and set cycles through a local
//! lock: `update` and `modify` fetch, compute and publish inside one critical
//! section, so two callers in this process never interleave a
//! read-modify-write. Writers in other processes are not excluded; the
//! broker keeps the last value written and broadcasts it back.
//!
//! Inbound updates are applied without taking the lock, since a lock holder
//! may be waiting on a response that only the receive loop can deliver. An
//! inbound update without a value keeps the current value and re-notifies
//! listeners with it.
//!
//! Listener errors are logged and never fail the operation or the session.

pub mod packets;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::identifier::Identifier;
use crate::core::serialization::{Json, Serializer};
use crate::error::{ProtocolError, Result};
use crate::event::{EventEmitter, ListenerId};
use crate::extension::endpoint::EndpointExtension;
use crate::network::engine::Network;

use self::packets::{
    RegistryPacket, RegistryPermissions, RegistryRegisterPacket, GET, LISTEN, REGISTER, UPDATE,
};

/// Identifier, default value and serializer of a registry.
pub struct RegistryType<T> {
    pub id: Identifier,
    pub default_value: T,
    pub permissions: RegistryPermissions,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T: Clone> Clone for RegistryType<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            default_value: self.default_value.clone(),
            permissions: self.permissions.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<T> RegistryType<T> {
    pub fn new(id: Identifier, default_value: T, serializer: impl Serializer<T>) -> Self {
        Self {
            id,
            default_value,
            permissions: RegistryPermissions::default(),
            serializer: Arc::new(serializer),
        }
    }

    pub fn with_permissions(mut self, permissions: RegistryPermissions) -> Self {
        self.permissions = permissions;
        self
    }
}

impl<T> RegistryType<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    pub fn json(id: Identifier, default_value: T) -> Self {
        Self::new(id, default_value, Json::new())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Type-erased view of a registry held by the extension.
trait RegistryEntry: Send + Sync {
    fn id(&self) -> &Identifier;
    fn permissions(&self) -> &RegistryPermissions;
    fn is_listening(&self) -> bool;
    fn apply(&self, value: Option<Bytes>) -> BoxFuture<'_, Result<()>>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct RegistryState<T> {
    registry_type: RegistryType<T>,
    value: Mutex<T>,
    exclusive: tokio::sync::Mutex<()>,
    listeners: EventEmitter<T>,
    network: Network,
    endpoints: EndpointExtension,
}

impl<T> RegistryState<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn decode(&self, value: Option<&[u8]>) -> Result<T> {
        match value {
            Some(bytes) => self.registry_type.serializer.deserialize(bytes),
            None => Ok(self.registry_type.default_value.clone()),
        }
    }

    /// Ask the broker for the current value. Caller holds `exclusive`.
    async fn fetch(&self) -> Result<T> {
        let packet = self
            .endpoints
            .call(&GET, &self.registry_type.id)
            .await?;
        let value = self.decode(packet.value.as_deref())?;
        *lock(&self.value) = value.clone();
        Ok(value)
    }

    /// Publish a value. Caller holds `exclusive`.
    fn publish(&self, value: &T) -> Result<()> {
        let bytes = self.registry_type.serializer.serialize(value)?;
        self.network.send(
            &UPDATE,
            &RegistryPacket {
                id: self.registry_type.id.clone(),
                value: Some(bytes),
            },
        )?;
        *lock(&self.value) = value.clone();
        Ok(())
    }

    async fn notify(&self, value: T) {
        if let Err(e) = self.listeners.emit(value).await {
            warn!(registry = %self.registry_type.id, error = %e, "Registry listener failed");
        }
    }
}

impl<T> RegistryEntry for RegistryState<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &Identifier {
        &self.registry_type.id
    }

    fn permissions(&self) -> &RegistryPermissions {
        &self.registry_type.permissions
    }

    fn is_listening(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn apply(&self, value: Option<Bytes>) -> BoxFuture<'_, Result<()>> {
        async move {
            let value = match value {
                Some(bytes) => {
                    let value = self.registry_type.serializer.deserialize(&bytes)?;
                    *lock(&self.value) = value.clone();
                    value
                }
                None => lock(&self.value).clone(),
            };
            self.notify(value).await;
            Ok(())
        }
        .boxed()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle to one registry. Cheap to clone.
pub struct Registry<T> {
    state: Arc<RegistryState<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Registry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn id(&self) -> &Identifier {
        &self.state.registry_type.id
    }

    /// Last value fetched, written or received; the default before that.
    pub fn value(&self) -> T {
        lock(&self.state.value).clone()
    }

    pub async fn get(&self) -> Result<T> {
        let value = {
            let _exclusive = self.state.exclusive.lock().await;
            self.state.fetch().await?
        };
        self.state.notify(value.clone()).await;
        Ok(value)
    }

    pub async fn set(&self, value: T) -> Result<()> {
        {
            let _exclusive = self.state.exclusive.lock().await;
            self.state.publish(&value)?;
        }
        self.state.notify(value).await;
        Ok(())
    }

    /// Replace the value with `f(current)` and return the new value.
    pub async fn update<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(T) -> T,
    {
        self.update_with(|value| futures::future::ready(Ok(f(value))))
            .await
    }

    /// Like [`Registry::update`], with a new value computed asynchronously.
    ///
    /// The lock is held while `f` runs, so `f` must not call back into this
    /// registry. An error from `f` publishes nothing.
    pub async fn update_with<F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = {
            let _exclusive = self.state.exclusive.lock().await;
            let value = f(self.state.fetch().await?).await?;
            self.state.publish(&value)?;
            value
        };
        self.state.notify(value.clone()).await;
        Ok(value)
    }

    /// Mutate the current value in place and return the result.
    pub async fn modify<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        self.update(|mut value| {
            f(&mut value);
            value
        })
        .await
    }

    /// Observe value changes. The first listener subscribes this client to
    /// broker broadcasts for the registry.
    pub fn listen<F, Fut>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let first = self.state.listeners.is_empty();
        let id = self.state.listeners.listen(listener);
        if first && self.state.network.is_ready() {
            self.state.network.send(&LISTEN, &self.state.registry_type.id)?;
        }
        Ok(id)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.state.listeners.unlisten(id)
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry({})", self.state.registry_type.id)
    }
}

struct Inner {
    network: Network,
    endpoints: EndpointExtension,
    registries: Mutex<HashMap<Identifier, Arc<dyn RegistryEntry>>>,
}

impl Inner {
    fn entries(&self) -> Vec<Arc<dyn RegistryEntry>> {
        lock(&self.registries).values().cloned().collect()
    }

    /// Re-announce listeners and register owned registries for a new session.
    fn announce(&self) -> Result<()> {
        let app_id = &self.network.app().id;
        for entry in self.entries() {
            if entry.is_listening() {
                self.network.send(&LISTEN, entry.id())?;
            }
            if entry.id().is_subpath_of(app_id) {
                debug!(registry = %entry.id(), "Registering owned registry");
                self.network.send(
                    &REGISTER,
                    &RegistryRegisterPacket {
                        id: entry.id().clone(),
                        permissions: entry.permissions().clone(),
                    },
                )?;
            }
        }
        Ok(())
    }

    async fn handle_update(&self, packet: &RegistryPacket) -> Result<()> {
        let entry = lock(&self.registries).get(&packet.id).cloned();
        match entry {
            Some(entry) => entry.apply(packet.value.clone()).await,
            None => {
                debug!(registry = %packet.id, "Ignoring update for unknown registry");
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct RegistryExtension {
    inner: Arc<Inner>,
}

impl RegistryExtension {
    pub fn new(network: &Network, endpoints: &EndpointExtension) -> Result<Self> {
        let extension = Self {
            inner: Arc::new(Inner {
                network: network.clone(),
                endpoints: endpoints.clone(),
                registries: Mutex::new(HashMap::new()),
            }),
        };

        network.register_packet(&REGISTER)?;
        network.register_packet(&UPDATE)?;
        network.register_packet(&LISTEN)?;

        let weak = Arc::downgrade(&extension.inner);
        network.add_packet_handler(&UPDATE, move |packet| {
            let weak: Weak<Inner> = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.handle_update(&packet).await,
                    None => Ok(()),
                }
            }
        })?;

        let weak = Arc::downgrade(&extension.inner);
        network.add_task(move || {
            let result = match weak.upgrade() {
                Some(inner) => inner.announce(),
                None => Ok(()),
            };
            futures::future::ready(result)
        })?;

        Ok(extension)
    }

    /// Registry for `registry_type`, created on first use.
    ///
    /// Fails if the identifier is already held with a different value type.
    pub fn get<T>(&self, registry_type: &RegistryType<T>) -> Result<Registry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut registries = lock(&self.inner.registries);
        if let Some(entry) = registries.get(&registry_type.id) {
            return Arc::clone(entry)
                .as_any()
                .downcast::<RegistryState<T>>()
                .map(|state| Registry { state })
                .map_err(|_| {
                    warn!(registry = %registry_type.id, "Registry requested with another type");
                    ProtocolError::InvalidState(format!(
                        "registry {} already exists with a different type",
                        registry_type.id
                    ))
                });
        }

        let state = Arc::new(RegistryState {
            registry_type: registry_type.clone(),
            value: Mutex::new(registry_type.default_value.clone()),
            exclusive: tokio::sync::Mutex::new(()),
            listeners: EventEmitter::new(),
            network: self.inner.network.clone(),
            endpoints: self.inner.endpoints.clone(),
        });
        registries.insert(registry_type.id.clone(), Arc::clone(&state) as Arc<dyn RegistryEntry>);
        Ok(Registry { state })
    }

    /// Registry with a JSON-encoded value under `id`.
    pub fn json<T>(&self, id: Identifier, default_value: T) -> Result<Registry<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.get(&RegistryType::json(id, default_value))
    }
}

impl std::fmt::Debug for RegistryExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryExtension")
            .field("registries", &lock(&self.inner.registries).len())
            .finish()
    }
}
