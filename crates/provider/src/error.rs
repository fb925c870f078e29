//! Errors reported by OAuth flow objects

/// Classification of flow errors to determine retry behaviour.
///
/// - Authentication: the grant is dead (invalid, expired, revoked); retrying
///   cannot help and the user has to log in again
/// - Transient: network trouble, 5xx, anything unrecognized; the caller may retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    Authentication,
}

/// Errors from flow entry points.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// The user declined the authorization request.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The device code or authorization code expired on the provider side.
    #[error("authorization expired: {0}")]
    Expired(String),

    /// The grant was rejected (invalid_grant, revoked refresh token, ...).
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// Network or HTTP failure talking to the provider.
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider returned an error the flow could not map.
    #[error("provider error: {0}")]
    Provider(String),

    /// The flow variant does not implement this entry point.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FlowError {
    /// Coarse classification used by the refresh path and session handlers.
    ///
    /// `Provider` errors are transient unless their message carries one of the
    /// OAuth error codes that mean the grant itself is unusable.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            FlowError::AccessDenied(_) | FlowError::Expired(_) | FlowError::InvalidGrant(_) => {
                ErrorClassification::Authentication
            }
            FlowError::Provider(msg) if mentions_dead_grant(msg) => {
                ErrorClassification::Authentication
            }
            FlowError::Transport(_) | FlowError::Provider(_) | FlowError::Unsupported(_) => {
                ErrorClassification::Transient
            }
        }
    }
}

/// OAuth error codes (RFC 6749 §5.2 and common provider variants) that mean
/// the credential cannot be used again.
const DEAD_GRANT_PATTERNS: &[&str] = &[
    "invalid_grant",
    "invalid_token",
    "unauthorized_client",
    "token revoked",
    "token has been revoked",
    "token expired",
    "token has expired",
];

fn mentions_dead_grant(message: &str) -> bool {
    let lower = message.to_lowercase();
    DEAD_GRANT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Result alias for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;
