//! Error types for credential storage

/// Errors from token and key stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store file parse error: {0}")]
    Parse(String),

    #[error("lock error: {0}")]
    Lock(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
