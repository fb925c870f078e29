//! Token store interface consumed by the broker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use provider::OAuthToken;

use crate::error::Result;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistent token storage keyed by `(provider, bucket)`.
///
/// Tokens are stored in full, including the refresh credential. Callers are
/// responsible for sanitizing anything they hand to a peer.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn TokenStore>`).
pub trait TokenStore: Send + Sync {
    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> StoreFuture<'a, Option<OAuthToken>>;

    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> StoreFuture<'a, ()>;

    /// Returns whether a token was present.
    fn remove_token<'a>(&'a self, provider: &'a str, bucket: &'a str) -> StoreFuture<'a, bool>;

    /// Providers with at least one stored bucket, sorted.
    fn list_providers(&self) -> StoreFuture<'_, Vec<String>>;

    /// Buckets stored for `provider`, sorted. Empty when the provider is unknown.
    fn list_buckets<'a>(&'a self, provider: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Take the advisory refresh lock for `(provider, bucket)`, waiting up to
    /// `wait`. Returns `false` if the lock is still held when the wait elapses.
    fn acquire_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        wait: Duration,
    ) -> StoreFuture<'a, bool>;

    fn release_lock<'a>(&'a self, provider: &'a str, bucket: &'a str) -> StoreFuture<'a, ()>;
}
