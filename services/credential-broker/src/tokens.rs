//! Token, API key and refresh handlers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use credential_store::TokenStore;
use provider::{OAuthFlow, OAuthToken, merge_refreshed};
use refresh::RefreshError;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dispatch::Broker;
use crate::protocol::{ErrorCode, Failure, HandlerResult};
use crate::validate::BucketRef;

/// How long a refresh or a peer save waits for the bucket's advisory lock.
pub const BUCKET_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Per-bucket request accounting for `get_bucket_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketUsage {
    pub request_count: u64,
    /// Unix seconds of the last `get_token`.
    pub last_used: Option<u64>,
}

/// In-memory usage counters. Reset on restart.
#[derive(Debug, Default)]
pub struct UsageTracker {
    buckets: Mutex<HashMap<(String, String), BucketUsage>>,
}

impl UsageTracker {
    pub fn record(&self, provider: &str, bucket: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let usage = buckets
            .entry((provider.to_string(), bucket.to_string()))
            .or_default();
        usage.request_count += 1;
        usage.last_used = Some(now);
    }

    pub fn get(&self, provider: &str, bucket: &str) -> BucketUsage {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .get(&(provider.to_string(), bucket.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

impl From<RefreshError> for Failure {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::RateLimited { retry_after } => {
                let millis = retry_after.as_nanos().div_ceil(1_000_000) as u64;
                Failure::rate_limited(millis.max(1))
            }
            RefreshError::NotFound(msg) => Failure::new(ErrorCode::NotFound, msg),
            RefreshError::NotAvailable(msg) => Failure::new(ErrorCode::RefreshNotAvailable, msg),
            RefreshError::NotConfigured(msg) => {
                Failure::new(ErrorCode::ProviderNotConfigured, msg)
            }
            RefreshError::ReauthRequired(msg) => Failure::new(ErrorCode::ReauthRequired, msg),
            RefreshError::Failed(msg) => Failure::new(ErrorCode::RefreshFailed, msg),
            RefreshError::Store(msg) => Failure::internal(msg),
        }
    }
}

fn not_found(provider: &str, bucket: &str) -> Failure {
    Failure::new(
        ErrorCode::NotFound,
        format!("no token stored for {provider}/{bucket}"),
    )
}

impl Broker {
    pub(crate) async fn get_token(&self, target: BucketRef) -> HandlerResult {
        let BucketRef { provider, bucket } = target;
        let token = self
            .tokens
            .get_token(&provider, &bucket)
            .await?
            .ok_or_else(|| not_found(&provider, &bucket))?;
        self.usage.record(&provider, &bucket);
        Ok(json!({ "token": token.to_peer_value() }))
    }

    /// Store a token supplied by a peer. A peer-supplied refresh credential
    /// is discarded; a stored one is kept.
    ///
    /// The read-merge-write runs under the bucket lock a refresh takes, so a
    /// credential rotated by a concurrent refresh is never written back over.
    pub(crate) async fn save_token(&self, target: BucketRef, token: OAuthToken) -> HandlerResult {
        let BucketRef { provider, bucket } = target;
        if token.has_refresh_token() {
            debug!(%provider, %bucket, "discarding refresh credential supplied by peer");
        }
        let incoming = token.sanitized();

        self.lock_bucket(&provider, &bucket).await?;
        let result = merge_and_save(self.tokens.as_ref(), &provider, &bucket, incoming).await;
        self.unlock_bucket(&provider, &bucket).await;
        result?;

        info!(%provider, %bucket, "token saved");
        Ok(json!({ "saved": true }))
    }

    /// Take the advisory lock refreshes hold while rewriting a bucket.
    pub(crate) async fn lock_bucket(&self, provider: &str, bucket: &str) -> Result<(), Failure> {
        if self
            .tokens
            .acquire_lock(provider, bucket, BUCKET_LOCK_WAIT)
            .await?
        {
            Ok(())
        } else {
            Err(Failure::internal(format!(
                "token for {provider}/{bucket} is locked by another writer"
            )))
        }
    }

    pub(crate) async fn unlock_bucket(&self, provider: &str, bucket: &str) {
        if let Err(e) = self.tokens.release_lock(provider, bucket).await {
            warn!(provider, bucket, error = %e, "failed to release bucket lock");
        }
    }

    pub(crate) async fn remove_token(&self, target: BucketRef) -> HandlerResult {
        let removed = self
            .tokens
            .remove_token(&target.provider, &target.bucket)
            .await?;
        if removed {
            info!(provider = %target.provider, bucket = %target.bucket, "token removed");
        }
        Ok(json!({ "removed": removed }))
    }

    pub(crate) async fn list_providers(&self) -> HandlerResult {
        let providers: Vec<String> = self
            .tokens
            .list_providers()
            .await?
            .into_iter()
            .filter(|p| self.policy.provider_allowed(p))
            .collect();
        Ok(json!({ "providers": providers }))
    }

    pub(crate) async fn list_buckets(&self, provider: String) -> HandlerResult {
        let buckets: Vec<String> = self
            .tokens
            .list_buckets(&provider)
            .await?
            .into_iter()
            .filter(|b| self.policy.bucket_allowed(b))
            .collect();
        Ok(json!({ "buckets": buckets }))
    }

    pub(crate) async fn get_bucket_stats(&self, target: BucketRef) -> HandlerResult {
        let BucketRef { provider, bucket } = target;
        let token = self.tokens.get_token(&provider, &bucket).await?;
        let usage = self.usage.get(&provider, &bucket);
        Ok(json!({
            "provider": provider,
            "bucket": bucket,
            "has_token": token.is_some(),
            "has_refresh_token": token.as_ref().is_some_and(OAuthToken::has_refresh_token),
            "expiry": token.as_ref().and_then(|t| t.expiry),
            "request_count": usage.request_count,
            "last_used": usage.last_used,
        }))
    }

    pub(crate) async fn get_api_key(&self, name: String) -> HandlerResult {
        let key = self
            .keys
            .get_key(&name)
            .await?
            .ok_or_else(|| Failure::new(ErrorCode::NotFound, format!("no API key named {name}")))?;
        Ok(json!({ "key": key.expose() }))
    }

    pub(crate) async fn list_api_keys(&self) -> HandlerResult {
        let names = self.keys.list_keys().await?;
        Ok(json!({ "names": names }))
    }

    pub(crate) async fn has_api_key(&self, name: String) -> HandlerResult {
        let exists = self.keys.has_key(&name).await?;
        Ok(json!({ "exists": exists }))
    }

    /// Refresh a stored token through its provider's flow.
    ///
    /// The pre-checks run outside the coordinator so a request that could
    /// never succeed does not start a cooldown window.
    pub(crate) async fn refresh_token(&self, target: BucketRef) -> HandlerResult {
        let BucketRef { provider, bucket } = target;
        let stored = self
            .tokens
            .get_token(&provider, &bucket)
            .await?
            .ok_or_else(|| not_found(&provider, &bucket))?;
        if !stored.has_refresh_token() {
            return Err(Failure::new(
                ErrorCode::RefreshNotAvailable,
                format!("token for {provider}/{bucket} has no refresh credential"),
            ));
        }
        let Some(flow) = self.flows.create(&provider) else {
            return Err(Failure::new(
                ErrorCode::ProviderNotConfigured,
                format!("no OAuth flow configured for provider {provider}"),
            ));
        };

        let store = self.tokens.clone();
        let (p, b) = (provider.clone(), bucket.clone());
        let token = self
            .refresher
            .refresh(&provider, &bucket, move || run_refresh(store, flow, p, b))
            .await?;
        Ok(json!({ "token": token.to_peer_value() }))
    }
}

async fn merge_and_save(
    store: &dyn TokenStore,
    provider: &str,
    bucket: &str,
    incoming: OAuthToken,
) -> credential_store::Result<()> {
    let merged = match store.get_token(provider, bucket).await? {
        Some(previous) => merge_refreshed(&previous, incoming),
        None => incoming,
    };
    store.save_token(provider, bucket, merged).await
}

/// Body of a coordinated refresh: lock, re-read, call the provider, merge,
/// persist, unlock.
async fn run_refresh(
    store: Arc<dyn TokenStore>,
    flow: Arc<dyn OAuthFlow>,
    provider: String,
    bucket: String,
) -> refresh::Result<OAuthToken> {
    let store_error = |e: credential_store::Error| RefreshError::Store(e.to_string());

    let locked = store
        .acquire_lock(&provider, &bucket, BUCKET_LOCK_WAIT)
        .await
        .map_err(store_error)?;
    if !locked {
        return Err(RefreshError::Failed(format!(
            "refresh lock for {provider}/{bucket} is held by another process"
        )));
    }

    let result = refresh_locked(store.as_ref(), flow.as_ref(), &provider, &bucket).await;

    if let Err(e) = store.release_lock(&provider, &bucket).await {
        warn!(%provider, %bucket, error = %e, "failed to release refresh lock");
    }
    result
}

async fn refresh_locked(
    store: &dyn TokenStore,
    flow: &dyn OAuthFlow,
    provider: &str,
    bucket: &str,
) -> refresh::Result<OAuthToken> {
    let store_error = |e: credential_store::Error| RefreshError::Store(e.to_string());

    // Another process may have refreshed or removed it while we waited.
    let current = store
        .get_token(provider, bucket)
        .await
        .map_err(store_error)?
        .ok_or_else(|| RefreshError::NotFound(format!("no token stored for {provider}/{bucket}")))?;
    let Some(refresh_token) = current.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(RefreshError::NotAvailable(format!(
            "token for {provider}/{bucket} has no refresh credential"
        )));
    };

    let fresh = flow.refresh(refresh_token).await?;
    let merged = merge_refreshed(&current, fresh);
    store
        .save_token(provider, bucket, merged.clone())
        .await
        .map_err(store_error)?;
    info!(provider, bucket, rotated = merged.refresh_token != current.refresh_token, "token refreshed");
    Ok(merged)
}
