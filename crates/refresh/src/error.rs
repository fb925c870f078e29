//! Error types for refresh coordination

use std::time::Duration;

/// Errors from a coordinated refresh.
///
/// `Clone` because one outcome is handed to every caller that joined the same
/// in-flight refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// A refresh for this key ran within the cooldown window.
    #[error("refresh rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// No token is stored for the key.
    #[error("no token stored for {0}")]
    NotFound(String),

    /// The stored token carries no refresh credential.
    #[error("stored token for {0} has no refresh credential")]
    NotAvailable(String),

    /// No flow factory is registered for the provider.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The grant is dead; the user has to log in again.
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),

    /// Transient provider or transport failure.
    #[error("refresh failed: {0}")]
    Failed(String),

    /// The token store failed while reading or persisting.
    #[error("token store error: {0}")]
    Store(String),
}

impl RefreshError {
    /// Whether this failure lengthens the backoff for the key.
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Failed(_) | RefreshError::Store(_))
    }
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;
