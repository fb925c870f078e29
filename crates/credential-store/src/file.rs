//! File-backed token store
//!
//! Manages a JSON file mapping provider → bucket → OAuth token. All writes use
//! atomic temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes concurrent writes from request handlers and refreshes.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use provider::OAuthToken;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock;
use crate::store::{StoreFuture, TokenStore};

type Buckets = BTreeMap<String, OAuthToken>;
type Tokens = BTreeMap<String, Buckets>;

/// Thread-safe token file manager.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the requested entry.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<Tokens>,
}

impl FileTokenStore {
    /// Load tokens from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with no
    /// stored credentials).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let tokens: Tokens = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing token file: {e}")))?;
            info!(
                path = %path.display(),
                providers = tokens.len(),
                "loaded tokens"
            );
            tokens
        } else {
            info!(path = %path.display(), "token file not found, starting with empty store");
            let tokens = Tokens::new();
            write_atomic(&path, &tokens).await?;
            tokens
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    async fn get(&self, provider: &str, bucket: &str) -> Option<OAuthToken> {
        let state = self.state.lock().await;
        state.get(provider).and_then(|b| b.get(bucket)).cloned()
    }

    /// Changes are made on a copy and only swapped in once persisted, so a
    /// failed write leaves memory matching disk.
    async fn save(&self, provider: &str, bucket: &str, token: OAuthToken) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.entry(provider.to_string())
            .or_default()
            .insert(bucket.to_string(), token);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(provider, bucket, "saved token");
        Ok(())
    }

    async fn remove(&self, provider: &str, bucket: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.get(provider).is_some_and(|b| b.contains_key(bucket)) {
            return Ok(false);
        }
        let mut next = state.clone();
        if let Some(buckets) = next.get_mut(provider) {
            buckets.remove(bucket);
            if buckets.is_empty() {
                next.remove(provider);
            }
        }
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(provider, bucket, "removed token");
        Ok(true)
    }

    async fn providers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    async fn buckets(&self, provider: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .get(provider)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl TokenStore for FileTokenStore {
    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> StoreFuture<'a, Option<OAuthToken>> {
        Box::pin(async move { Ok(self.get(provider, bucket).await) })
    }

    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.save(provider, bucket, token))
    }

    fn remove_token<'a>(&'a self, provider: &'a str, bucket: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.remove(provider, bucket))
    }

    fn list_providers(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.providers().await) })
    }

    fn list_buckets<'a>(&'a self, provider: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move { Ok(self.buckets(provider).await) })
    }

    fn acquire_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        wait: Duration,
    ) -> StoreFuture<'a, bool> {
        let path = lock::lock_path(self.lock_dir(), provider, bucket);
        Box::pin(async move { lock::acquire(&path, wait).await })
    }

    fn release_lock<'a>(&'a self, provider: &'a str, bucket: &'a str) -> StoreFuture<'a, ()> {
        let path = lock::lock_path(self.lock_dir(), provider, bucket);
        Box::pin(async move { lock::release(&path).await })
    }
}

/// Write a JSON document to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The temp file is created 0600 (owner read/write only) since
/// the file contains credentials.
pub(crate) async fn write_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    // A leftover temp file would keep its old mode; start from a fresh one.
    match tokio::fs::remove_file(&tmp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(format!("removing stale temp store file: {e}"))),
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp store file: {e}")))?;
    file.write_all(json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp store file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_token(suffix: &str) -> OAuthToken {
        OAuthToken::new(format!("at_{suffix}")).with_refresh_token(format!("rt_{suffix}"))
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::load(path.clone()).await.unwrap();
        store
            .save_token("gemini", "default", test_token("1"))
            .await
            .unwrap();

        let store2 = FileTokenStore::load(path).await.unwrap();
        let token = store2.get_token("gemini", "default").await.unwrap().unwrap();
        assert_eq!(token.access_token, "at_1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_1"));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        assert!(!path.exists());
        let store = FileTokenStore::load(path.clone()).await.unwrap();
        assert!(store.list_providers().await.unwrap().is_empty());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Tokens = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = FileTokenStore::load(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        store.save_token("qwen", "work", test_token("w")).await.unwrap();
        store
            .save_token("qwen", "personal", test_token("p"))
            .await
            .unwrap();

        let work = store.get_token("qwen", "work").await.unwrap().unwrap();
        let personal = store.get_token("qwen", "personal").await.unwrap().unwrap();
        assert_eq!(work.access_token, "at_w");
        assert_eq!(personal.access_token, "at_p");
        assert!(store.get_token("qwen", "default").await.unwrap().is_none());

        assert_eq!(
            store.list_buckets("qwen").await.unwrap(),
            vec!["personal", "work"]
        );
        assert!(store.list_buckets("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_reports_presence_and_prunes_empty_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        store
            .save_token("anthropic", "default", test_token("1"))
            .await
            .unwrap();

        assert!(store.remove_token("anthropic", "default").await.unwrap());
        assert!(!store.remove_token("anthropic", "default").await.unwrap());
        assert!(store.list_providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_providers_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        store.save_token("qwen", "default", test_token("q")).await.unwrap();
        store
            .save_token("anthropic", "default", test_token("a"))
            .await
            .unwrap();

        assert_eq!(
            store.list_providers().await.unwrap(),
            vec!["anthropic", "qwen"]
        );
    }

    #[tokio::test]
    async fn extensions_survive_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::load(path.clone()).await.unwrap();

        let mut token = test_token("x");
        token
            .extra
            .insert("resource_url".into(), serde_json::json!("portal.qwen.ai"));
        store.save_token("qwen", "default", token).await.unwrap();

        let reloaded = FileTokenStore::load(path).await.unwrap();
        let token = reloaded.get_token("qwen", "default").await.unwrap().unwrap();
        assert_eq!(token.extra["resource_url"], "portal.qwen.ai");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::load(path.clone()).await.unwrap();
        store
            .save_token("gemini", "default", test_token("1"))
            .await
            .unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn leftover_temp_file_does_not_leak_its_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::load(path.clone()).await.unwrap();

        let tmp = dir
            .path()
            .join(format!(".tokens.json.tmp.{}", std::process::id()));
        std::fs::write(&tmp, b"partial").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        store
            .save_token("gemini", "default", test_token("1"))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        let store = FileTokenStore::load(data_dir.join("tokens.json"))
            .await
            .unwrap();
        store
            .save_token("gemini", "default", test_token("1"))
            .await
            .unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();

        let result = store.save_token("gemini", "work", test_token("2")).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(store.get_token("gemini", "work").await.unwrap().is_none());

        let result = store.remove_token("gemini", "default").await;
        assert!(matches!(result, Err(Error::Io(_))));
        let kept = store.get_token("gemini", "default").await.unwrap().unwrap();
        assert_eq!(kept.access_token, "at_1");
    }

    #[tokio::test]
    async fn store_lock_is_exclusive_per_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();

        assert!(store.acquire_lock("gemini", "default", Duration::ZERO).await.unwrap());
        assert!(!store.acquire_lock("gemini", "default", Duration::ZERO).await.unwrap());
        assert!(store.acquire_lock("gemini", "work", Duration::ZERO).await.unwrap());

        store.release_lock("gemini", "default").await.unwrap();
        assert!(store.acquire_lock("gemini", "default", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = Arc::new(FileTokenStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save_token("gemini", &format!("bucket-{i}"), test_token(&i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.list_buckets("gemini").await.unwrap().len(), 10);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Tokens = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["gemini"].len(), 10);
    }
}
