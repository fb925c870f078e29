//! Advisory lock files
//!
//! A lock is a file created with `O_EXCL` next to the store file. The holder's
//! pid is written into it for operators. Locks older than `STALE_AFTER` are
//! assumed to belong to a crashed process and are broken.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Age after which a lock file is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Lock file path for `(provider, bucket)` inside `dir`.
pub fn lock_path(dir: &Path, provider: &str, bucket: &str) -> PathBuf {
    dir.join(format!(
        ".{}.{}.lock",
        file_component(provider),
        file_component(bucket)
    ))
}

fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Try to create the lock file, retrying until `wait` elapses.
pub async fn acquire(path: &Path, wait: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                let pid = std::process::id().to_string();
                file.write_all(pid.as_bytes())
                    .await
                    .map_err(|e| Error::Lock(format!("writing lock file: {e}")))?;
                debug!(path = %path.display(), "acquired lock");
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(path).await {
                    warn!(path = %path.display(), "breaking stale lock");
                    let _ = tokio::fs::remove_file(path).await;
                    continue;
                }
            }
            Err(e) => return Err(Error::Lock(format!("creating lock file: {e}"))),
        }

        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

/// Remove the lock file. Releasing a lock that is not held is not an error.
pub async fn release(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "released lock");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Lock(format!("removing lock file: {e}"))),
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_AFTER)
}
