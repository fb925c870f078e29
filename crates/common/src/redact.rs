//! Redaction of secrets from messages that cross the trust boundary
//!
//! Provider errors routinely echo request bodies back (`invalid_grant` with the
//! offending refresh token, a device code in a URL, ...). Every error string the
//! broker sends to a peer goes through [`redact`] first.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement marker for redacted material.
pub const REDACTED: &str = "[REDACTED]";

/// Maximum length of a peer-visible message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 256;

/// `name=value` / `name: value` pairs whose name only ever labels a secret.
static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(access_token|refresh_token|id_token|code_verifier|device_code|client_secret|api_key|apikey|password)("?\s*[:=]\s*"?)[^\s"'&,;}]+"#,
    )
    .expect("static regex")
});

/// Generic names (`code`, `state`, ...) are common in prose ("status code:
/// 400"), so they are only matched as a query parameter or a JSON field.
static PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\b(?:code|state|token|secret)=|"(?:code|state|token|secret)"\s*:\s*"?)[^\s"'&,;}]+"#)
        .expect("static regex")
});

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=-]+").expect("static regex"));

/// Long opaque runs: JWTs, refresh tokens, API keys.
static OPAQUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._~+/-]{24,}={0,2}").expect("static regex"));

/// Redact token-like substrings and cap the length of `message`.
pub fn redact(message: &str) -> String {
    let out = KEY_VALUE.replace_all(message, format!("${{1}}${{2}}{REDACTED}"));
    let out = PARAM.replace_all(&out, format!("${{1}}{REDACTED}"));
    let out = BEARER.replace_all(&out, format!("${{1}} {REDACTED}"));
    let out = OPAQUE.replace_all(&out, REDACTED);
    truncate(&out, MAX_MESSAGE_CHARS)
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
