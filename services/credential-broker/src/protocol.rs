//! Wire envelope and response frames
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! object (the prefix is handled by `LengthDelimitedCodec`). Requests are
//! `{id, op, payload}`; responses are `{id, ok: true, data}` or
//! `{id, ok: false, code, error, field?, retry_after?}`.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    ProviderNotConfigured,
    SessionNotFound,
    SessionAlreadyUsed,
    SessionExpired,
    AccessDenied,
    ExchangeFailed,
    RateLimited,
    NotFound,
    RefreshNotAvailable,
    RefreshFailed,
    ReauthRequired,
    FlowInitiationFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ProviderNotConfigured => "PROVIDER_NOT_CONFIGURED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionAlreadyUsed => "SESSION_ALREADY_USED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::ExchangeFailed => "EXCHANGE_FAILED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RefreshNotAvailable => "REFRESH_NOT_AVAILABLE",
            ErrorCode::RefreshFailed => "REFRESH_FAILED",
            ErrorCode::ReauthRequired => "REAUTH_REQUIRED",
            ErrorCode::FlowInitiationFailed => "FLOW_INITIATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler failure on its way to becoming an error frame.
///
/// The message is redacted on construction, so nothing built through these
/// constructors can carry a token-shaped substring to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub code: ErrorCode,
    pub message: String,
    pub field: Option<String>,
    /// Milliseconds until a retry can succeed (`RATE_LIMITED` only).
    pub retry_after: Option<u64>,
}

impl Failure {
    pub fn new(code: ErrorCode, message: impl AsRef<str>) -> Self {
        Self {
            code,
            message: common::redact(message.as_ref()),
            field: None,
            retry_after: None,
        }
    }

    /// `INVALID_REQUEST` naming the offending field.
    pub fn invalid(field: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message).with_field(field)
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            retry_after: Some(retry_after_ms),
            ..Self::new(
                ErrorCode::RateLimited,
                format!("rate limit exceeded, retry after {retry_after_ms}ms"),
            )
        }
        .with_field("retry_after")
    }

    pub fn internal(message: impl AsRef<str>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl From<credential_store::Error> for Failure {
    fn from(err: credential_store::Error) -> Self {
        Failure::internal(err.to_string())
    }
}

/// Outcome of a handler.
pub type HandlerResult = std::result::Result<Value, Failure>;

/// A frame that cannot be processed at all; the connection is closed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Decode a frame body into a JSON object.
pub fn decode_frame(body: &[u8]) -> Result<Map<String, Value>, FrameError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FrameError::Json(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(FrameError::NotAnObject),
    }
}

/// A response frame.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Response {
    pub fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            code: None,
            error: None,
            field: None,
            retry_after: None,
        }
    }

    pub fn failure(id: Value, failure: Failure) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            code: Some(failure.code),
            error: Some(failure.message),
            field: failure.field,
            retry_after: failure.retry_after,
        }
    }

    pub fn from_result(id: Value, result: HandlerResult) -> Self {
        match result {
            Ok(data) => Self::success(id, data),
            Err(failure) => Self::failure(id, failure),
        }
    }

    /// Label used for the `outcome` metric: `ok` or the lowercased code.
    pub fn outcome(&self) -> String {
        match self.code {
            None => "ok".to_string(),
            Some(code) => code.as_str().to_ascii_lowercase(),
        }
    }

    /// Serialize into a frame body.
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
