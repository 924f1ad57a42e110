//! Token storage keyed by broker address and application.
//!
//! The key is the JSON array `[host, port, hash, app key]`, so a token issued
//! by one broker installation is never offered to another one on the same
//! host and port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::app::App;
use crate::error::{ProtocolError, Result};
use crate::network::address::Address;

pub trait TokenProvider: Send + Sync {
    fn get<'a>(&'a self, address: &'a Address, app: &'a App) -> BoxFuture<'a, Result<Option<String>>>;

    fn set<'a>(
        &'a self,
        address: &'a Address,
        app: &'a App,
        token: String,
    ) -> BoxFuture<'a, Result<()>>;
}

pub fn token_key(address: &Address, app: &App) -> String {
    serde_json::json!([
        address.host,
        address.port,
        address.hash.as_deref().unwrap_or(""),
        app.id.key()
    ])
    .to_string()
}

/// Tokens held for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryTokenProvider {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a token, as if the broker had issued it earlier.
    pub fn insert(&self, address: &Address, app: &App, token: impl Into<String>) {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token_key(address, app), token.into());
    }
}

impl TokenProvider for MemoryTokenProvider {
    fn get<'a>(&'a self, address: &'a Address, app: &'a App) -> BoxFuture<'a, Result<Option<String>>> {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&token_key(address, app))
            .cloned();
        Box::pin(async move { Ok(token) })
    }

    fn set<'a>(
        &'a self,
        address: &'a Address,
        app: &'a App,
        token: String,
    ) -> BoxFuture<'a, Result<()>> {
        self.insert(address, app, token);
        Box::pin(async { Ok(()) })
    }
}

/// Tokens persisted as a JSON object in a file.
#[derive(Debug)]
pub struct FileTokenProvider {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(tokens) => Ok(tokens),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Token file is corrupt, starting empty");
                    Ok(HashMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_inner(&self, address: &Address, app: &App) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(&token_key(address, app)))
    }

    async fn set_inner(&self, address: &Address, app: &App, token: String) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.load().await?;
        tokens.insert(token_key(address, app), token);
        let bytes = serde_json::to_vec_pretty(&tokens)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, bytes).await?;
        debug!(path = %self.path.display(), "Stored token");
        Ok(())
    }
}

impl TokenProvider for FileTokenProvider {
    fn get<'a>(&'a self, address: &'a Address, app: &'a App) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(self.get_inner(address, app))
    }

    fn set<'a>(
        &'a self,
        address: &'a Address,
        app: &'a App,
        token: String,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.set_inner(address, app, token))
    }
}
