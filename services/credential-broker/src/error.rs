//! Service-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Broker lifecycle errors raised while creating the listening socket.
///
/// Per-request failures never propagate as Rust errors; handlers turn them
/// into error response frames (see `protocol::Failure`).
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[error("socket {} is already in use by a running broker", .0.display())]
    SocketInUse(PathBuf),

    #[error("socket path {} exists and is not a socket; remove it or choose another path", .0.display())]
    SocketWrongType(PathBuf),

    #[error("socket path name too long ({len} bytes, platform limit is {max})")]
    SocketPathTooLong { len: usize, max: usize },

    #[error("permission denied for socket path {}: {source}", path.display())]
    SocketPermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind socket {}: {source}", path.display())]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the lifecycle should back off and try binding again.
    ///
    /// In-use, wrong type, name too long and permission errors need operator
    /// action; retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SocketBind { .. })
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
