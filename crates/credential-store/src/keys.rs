//! API key storage
//!
//! Named API keys (`provider` → key) for providers that authenticate with a
//! static key instead of OAuth. Persisted with the same atomic 0600 write as
//! the token file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::file::write_atomic;
use crate::store::StoreFuture;

/// Persistent storage for named API keys.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn KeyStore>`).
pub trait KeyStore: Send + Sync {
    fn get_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<Secret<String>>>;

    fn save_key<'a>(&'a self, name: &'a str, key: Secret<String>) -> StoreFuture<'a, ()>;

    /// Returns whether a key was present.
    fn delete_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool>;

    /// Stored key names, sorted.
    fn list_keys(&self) -> StoreFuture<'_, Vec<String>>;

    fn has_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool>;
}

/// JSON-file key store.
pub struct FileKeyStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, String>>,
}

impl FileKeyStore {
    /// Load keys from `path`, creating an empty file on cold start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading key file: {e}")))?;
            let keys: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing key file: {e}")))?;
            info!(path = %path.display(), keys = keys.len(), "loaded API keys");
            keys
        } else {
            info!(path = %path.display(), "key file not found, starting with empty store");
            let keys = BTreeMap::new();
            write_atomic(&path, &keys).await?;
            keys
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, name: &str, key: Secret<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.insert(name.to_string(), key.expose().clone());
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(name, "saved API key");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.contains_key(name) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.remove(name);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(name, "deleted API key");
        Ok(true)
    }
}

impl KeyStore for FileKeyStore {
    fn get_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<Secret<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(name).cloned().map(Secret::new))
        })
    }

    fn save_key<'a>(&'a self, name: &'a str, key: Secret<String>) -> StoreFuture<'a, ()> {
        Box::pin(self.save(name, key))
    }

    fn delete_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.delete(name))
    }

    fn list_keys(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.keys().cloned().collect())
        })
    }

    fn has_key<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.state.lock().await.contains_key(name)) })
    }
}
