//! OAuth flow abstraction for the credential broker
//!
//! Defines the `OAuthFlow` trait that decouples the broker's session state
//! machine from provider-specific wire clients. The broker never talks HTTP
//! itself: embedders register a factory per provider in a `FlowRegistry`, and
//! the broker builds a fresh flow object for every login session.
//!
//! Flow variants form a closed set (`FlowType`). The broker dispatches on the
//! tag; a flow only implements the entry points its variant needs.

pub mod error;
pub mod pkce;
pub mod registry;
pub mod token;

pub use error::{ErrorClassification, FlowError, Result};
pub use registry::{FlowFactory, FlowRegistry};
pub use token::{OAuthToken, merge_refreshed, sanitize_value};

use common::Secret;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by flow entry points.
pub type FlowFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Login flow variant, fixed when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Authorization code + PKCE; the peer pastes the code back (`exchange`).
    PkceRedirect,
    /// RFC 8628 device authorization; the broker polls (`poll`).
    DeviceCode,
    /// Browser redirect to a local callback the flow listens on; polled.
    BrowserRedirect,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::PkceRedirect => "pkce_redirect",
            FlowType::DeviceCode => "device_code",
            FlowType::BrowserRedirect => "browser_redirect",
        }
    }

    /// Whether sessions of this type complete through `poll`.
    pub fn is_polled(&self) -> bool {
        matches!(self, FlowType::DeviceCode | FlowType::BrowserRedirect)
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of starting a login.
///
/// `auth_url`, `user_code`, `verification_uri` and `interval_secs` are shown to
/// the user. `device_code` and `state` are correlation values the broker keeps
/// inside the session and never returns to a peer.
#[derive(Debug, Clone, Default)]
pub struct FlowInitiation {
    pub auth_url: Option<String>,
    pub user_code: Option<String>,
    pub verification_uri: Option<String>,
    pub interval_secs: Option<u64>,
    pub device_code: Option<Secret<String>>,
    pub state: Option<Secret<String>>,
}

/// Outcome of a single poll against a device-code or browser flow.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// User has not finished authorizing yet.
    Pending,
    /// Provider asked us to back off. `None` means "add the default step".
    SlowDown { interval_secs: Option<u64> },
    /// Authorization finished; full token including any refresh credential.
    Complete(OAuthToken),
}

/// A provider-specific, stateful OAuth flow.
///
/// One instance is created per login session and owned by it, so PKCE
/// verifiers and device codes never leak between concurrent logins. Entry
/// points a variant does not support keep the default `Unsupported` error.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn OAuthFlow>`).
pub trait OAuthFlow: Send + Sync {
    /// Variant this flow implements.
    fn flow_type(&self) -> FlowType;

    /// Start a login: generate verifier/state or request a device code.
    fn initiate(&self) -> FlowFuture<'_, FlowInitiation>;

    /// Exchange an authorization code (PKCE redirect flows).
    fn exchange<'a>(&'a self, code: &'a str) -> FlowFuture<'a, OAuthToken> {
        let _ = code;
        unsupported(self.flow_type(), "exchange")
    }

    /// Poll for completion (device-code and browser flows).
    fn poll<'a>(&'a self, device_code: &'a str) -> FlowFuture<'a, PollOutcome> {
        let _ = device_code;
        unsupported(self.flow_type(), "poll")
    }

    /// Trade a refresh credential for a new token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> FlowFuture<'a, OAuthToken> {
        let _ = refresh_token;
        unsupported(self.flow_type(), "refresh")
    }
}

fn unsupported<'a, T: 'a>(flow_type: FlowType, entry: &'static str) -> FlowFuture<'a, T> {
    Box::pin(async move {
        Err(FlowError::Unsupported(format!(
            "{flow_type} flow does not implement {entry}"
        )))
    })
}
