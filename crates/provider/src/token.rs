//! OAuth token type, sanitization and refresh merge
//!
//! The broker treats tokens as opaque except for the refresh credential: it is
//! persisted, but stripped from every value that crosses to a peer, and it is
//! carried forward when a refresh response omits it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the refresh credential on the wire and on disk.
pub const REFRESH_TOKEN_FIELD: &str = "refresh_token";

/// An OAuth token as persisted by the token store.
///
/// `expiry` is an absolute unix timestamp in seconds. Provider-specific
/// extensions (`id_token`, `resource_url`, account ids, ...) are kept in
/// `extra` and round-trip verbatim.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OAuthToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            expiry: None,
            scope: None,
            extra: Map::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Whether a usable (non-empty) refresh credential is present.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Copy safe to hand to a peer: refresh credential removed, everything
    /// else preserved.
    pub fn sanitized(&self) -> OAuthToken {
        let mut copy = self.clone();
        copy.refresh_token = None;
        copy.extra.remove(REFRESH_TOKEN_FIELD);
        copy
    }

    /// Sanitized JSON form, ready to embed in a response frame.
    pub fn to_peer_value(&self) -> Value {
        serde_json::to_value(self.sanitized())
            .map(|v| sanitize_value(&v))
            .unwrap_or(Value::Null)
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .field("scope", &self.scope)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Remove the refresh credential from any token-shaped JSON value.
///
/// Non-object values are returned unchanged. Only the top-level field is
/// removed; extension objects are preserved verbatim.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut copy = map.clone();
            copy.remove(REFRESH_TOKEN_FIELD);
            Value::Object(copy)
        }
        other => other.clone(),
    }
}

/// Merge a freshly issued token over the previously stored one.
///
/// Every field present on `fresh` wins. Fields `fresh` omits keep their
/// previous value; in particular an omitted (or empty) refresh credential
/// preserves the old one, since many providers do not rotate it.
pub fn merge_refreshed(previous: &OAuthToken, fresh: OAuthToken) -> OAuthToken {
    let refresh_token = if fresh.has_refresh_token() {
        fresh.refresh_token
    } else {
        previous.refresh_token.clone()
    };

    let mut extra = previous.extra.clone();
    extra.extend(fresh.extra);
    extra.remove(REFRESH_TOKEN_FIELD);

    OAuthToken {
        access_token: fresh.access_token,
        refresh_token,
        token_type: fresh.token_type.or_else(|| previous.token_type.clone()),
        expiry: fresh.expiry.or(previous.expiry),
        scope: fresh.scope.or_else(|| previous.scope.clone()),
        extra,
    }
}
