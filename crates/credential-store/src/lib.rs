//! Credential storage collaborators for the broker
//!
//! The broker core only sees the `TokenStore` and `KeyStore` traits. This
//! crate also ships file-backed implementations used by the stock binary:
//!
//! - `FileTokenStore`: JSON file of `provider → bucket → OAuthToken`, atomic
//!   0600 writes, advisory lock files for refresh serialization
//! - `FileKeyStore`: JSON file of named API keys, same write discipline
//!
//! Both files are the single source of truth for a single broker process; the
//! in-memory copy is loaded once at startup and every mutation is persisted
//! before it returns.

pub mod error;
pub mod file;
pub mod keys;
pub mod lock;
pub mod store;

pub use error::{Error, Result};
pub use file::FileTokenStore;
pub use keys::{FileKeyStore, KeyStore};
pub use store::{StoreFuture, TokenStore};
