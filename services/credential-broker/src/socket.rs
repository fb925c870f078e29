//! Unix socket creation and cleanup
//!
//! The parent directory is created 0700 (an existing one must belong to the
//! broker user and is tightened to 0700) and the socket chmod'ed 0600 right
//! after bind. The directory keeps other users out while the socket still has
//! umask permissions, so every directory above it must be safe from renames
//! by other users. A leftover socket file from a crashed broker is detected
//! by connecting to it: refused means stale (removed, then bound), accepted
//! means another broker is live.

use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::effective_uid;

/// Size of `sockaddr_un.sun_path`, including the trailing NUL.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub const SUN_PATH_LEN: usize = 104;
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub const SUN_PATH_LEN: usize = 108;

/// Longest socket path the platform accepts.
pub const MAX_SOCKET_PATH: usize = SUN_PATH_LEN - 1;

fn io_error(path: &Path, source: std::io::Error) -> Error {
    match source.kind() {
        ErrorKind::PermissionDenied => Error::SocketPermissionDenied {
            path: path.to_path_buf(),
            source,
        },
        _ => Error::SocketBind {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Create the listening socket at `path`.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(Error::SocketPathTooLong {
            len,
            max: MAX_SOCKET_PATH,
        });
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        prepare_parent(parent).await?;
    }

    remove_stale(path).await?;

    let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
        ErrorKind::AddrInUse => Error::SocketInUse(path.to_path_buf()),
        _ => io_error(path, e),
    })?;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| io_error(path, e))?;

    info!(path = %path.display(), "socket bound");
    Ok(listener)
}

/// How an existing socket directory is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentDir {
    /// Owned by the broker user and closed to everyone else
    Private,
    /// Owned by the broker user but open to group or others; tightened to 0700
    Loose,
    /// Owned by someone else; never used
    Foreign,
}

fn classify_parent(owner: u32, mode: u32, euid: u32) -> ParentDir {
    if owner != euid {
        ParentDir::Foreign
    } else if mode & 0o077 != 0 {
        ParentDir::Loose
    } else {
        ParentDir::Private
    }
}

/// Whether a directory above the socket directory is safe from renames by
/// other users: owned by the broker user or root, and not writable by group
/// or others unless sticky (`/tmp`).
fn ancestor_is_safe(owner: u32, mode: u32, euid: u32) -> bool {
    (owner == euid || owner == 0) && (mode & 0o022 == 0 || mode & 0o1000 != 0)
}

async fn check_ancestors(parent: &Path) -> Result<()> {
    let euid = effective_uid();
    for dir in parent.ancestors().skip(1).filter(|d| !d.as_os_str().is_empty()) {
        let metadata = match tokio::fs::metadata(dir).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error(dir, e)),
        };
        if !ancestor_is_safe(metadata.uid(), metadata.permissions().mode(), euid) {
            return Err(Error::SocketPermissionDenied {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    ErrorKind::PermissionDenied,
                    format!("directory is modifiable by uid {} or other users", metadata.uid()),
                ),
            });
        }
    }
    Ok(())
}

/// Create the socket directory 0700, or make sure an existing one belongs to
/// the broker user and admits nobody else.
async fn prepare_parent(parent: &Path) -> Result<()> {
    check_ancestors(parent).await?;

    let metadata = match tokio::fs::metadata(parent).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
            debug!(dir = %parent.display(), "created socket directory");
            return Ok(());
        }
        Err(e) => return Err(io_error(parent, e)),
    };

    if !metadata.is_dir() {
        return Err(Error::SocketWrongType(parent.to_path_buf()));
    }

    let mode = metadata.permissions().mode() & 0o7777;
    match classify_parent(metadata.uid(), mode, effective_uid()) {
        ParentDir::Private => Ok(()),
        ParentDir::Loose => {
            warn!(dir = %parent.display(), mode = %format_args!("{mode:o}"), "tightening socket directory to 0700");
            tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| io_error(parent, e))
        }
        ParentDir::Foreign => Err(Error::SocketPermissionDenied {
            path: parent.to_path_buf(),
            source: std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("directory is owned by uid {}", metadata.uid()),
            ),
        }),
    }
}

/// Remove a socket file left behind by a broker that is no longer running.
async fn remove_stale(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error(path, e)),
    };

    if !metadata.file_type().is_socket() {
        return Err(Error::SocketWrongType(path.to_path_buf()));
    }

    match UnixStream::connect(path).await {
        Ok(_) => Err(Error::SocketInUse(path.to_path_buf())),
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            warn!(path = %path.display(), "removing stale socket");
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(path, e)),
            }
        }
        Err(e) => Err(io_error(path, e)),
    }
}

/// Remove the socket file at shutdown.
pub fn cleanup(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "socket removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
    }
}
