//! Common types shared by the credential broker crates

mod error;
pub mod redact;
mod secret;

pub use error::{Error, Result};
pub use redact::redact;
pub use secret::Secret;

/// Bucket used when a request names no bucket.
pub const DEFAULT_BUCKET: &str = "default";
