//! # Event Emitter
//!
//! Ordered fan-out of a value to async listeners.
//!
//! `emit` awaits each listener in subscription order before the next one
//! runs, so listeners observe events in the same order they were emitted.
//! The listener list is snapshotted at the start of `emit`: a listener added
//! during an emission first sees the next event.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Result;

/// Handle returned by `listen`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct EventEmitter<T> {
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe an async listener.
    pub fn listen<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener<T> = Arc::new(move |value| listener(value).boxed());
        self.lock().push((id, listener));
        id
    }

    /// Subscribe a synchronous, infallible listener.
    pub fn listen_sync<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.listen(move |value| {
            listener(value);
            futures::future::ready(Ok(()))
        })
    }

    /// Returns false if the listener was already removed.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver `value` to every listener in order. Stops at the first error.
    pub async fn emit(&self, value: T) -> Result<()> {
        let snapshot: Vec<Listener<T>> = self.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener(value.clone()).await?;
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventEmitter").field("listeners", &count).finish()
    }
}
