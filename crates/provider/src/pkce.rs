//! PKCE (RFC 7636) and random identifier helpers
//!
//! Flow implementations use the verifier/challenge pair; the broker uses
//! `random_urlsafe` for session identifiers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

/// `len` cryptographically random bytes, URL-safe base64 without padding.
pub fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier.
///
/// 64 random bytes encode to 86 characters, inside the 43-128 range RFC 7636
/// allows.
pub fn generate_verifier() -> String {
    random_urlsafe(64)
}

/// Generate an opaque `state` value for CSRF protection.
pub fn generate_state() -> String {
    random_urlsafe(32)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Short, non-reversible fingerprint of an identifier for log lines.
pub fn fingerprint(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    hash[..4].iter().map(|b| format!("{b:02x}")).collect()
}
