use crate::core::identifier::Identifier;
use crate::error::{ProtocolError, Result};
use crate::event::{EventEmitter, ListenerId};
use crate::protocol::packet::Packet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Packet dispatcher with one ordered listener set per registered type.
///
/// Listener sets are created when a packet type is registered, so handlers can
/// only be attached to types the mapper knows about. Dispatching a packet
/// awaits every listener of its type in subscription order.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<Identifier, Arc<EventEmitter<Packet>>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the listener set for a packet type.
    pub fn register(&self, id: &Identifier) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::InvalidState("Failed to acquire write lock on dispatcher".to_string())
        })?;
        if handlers.contains_key(id) {
            return Err(ProtocolError::DuplicateRegistration(id.key()));
        }
        handlers.insert(id.clone(), Arc::new(EventEmitter::new()));
        Ok(())
    }

    fn listeners(&self, id: &Identifier) -> Result<Arc<EventEmitter<Packet>>> {
        let handlers = self.handlers.read().map_err(|_| {
            ProtocolError::InvalidState("Failed to acquire read lock on dispatcher".to_string())
        })?;
        handlers
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::UnregisteredPacket(id.key()))
    }

    pub fn add_handler<F, Fut>(&self, id: &Identifier, handler: F) -> Result<ListenerId>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Ok(self.listeners(id)?.listen(handler))
    }

    pub fn remove_handler(&self, id: &Identifier, listener: ListenerId) -> Result<bool> {
        Ok(self.listeners(id)?.unlisten(listener))
    }

    pub async fn dispatch(&self, packet: Packet) -> Result<()> {
        let listeners = self.listeners(&packet.id)?;
        listeners.emit(packet).await
    }
}
