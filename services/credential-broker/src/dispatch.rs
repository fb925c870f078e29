//! Request routing and provider/bucket authorization
//!
//! `Broker` owns the collaborators (token store, key store, flow registry)
//! and the shared state (login sessions, refresh coordinator, bucket usage).
//! Handlers live next to their concern in `oauth.rs` and `tokens.rs`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use credential_store::{KeyStore, TokenStore};
use provider::FlowRegistry;
use refresh::RefreshCoordinator;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::peer::PeerIdentity;
use crate::protocol::{ErrorCode, Failure, HandlerResult};
use crate::session::SessionStore;
use crate::tokens::UsageTracker;
use crate::validate::Request;

/// Runtime settings the broker needs from `[broker]`.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub session_timeout: Duration,
    pub refresh_cooldown: Duration,
    pub bind_sessions_to_peer: bool,
    pub allowed_providers: Option<Vec<String>>,
    pub allowed_buckets: Option<Vec<String>>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            refresh_cooldown: Duration::from_secs(config.refresh_cooldown_secs),
            bind_sessions_to_peer: config.bind_sessions_to_peer,
            allowed_providers: config.allowed_providers.clone(),
            allowed_buckets: config.allowed_buckets.clone(),
        }
    }
}

/// Optional provider/bucket allowlists. `None` allows everything.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    providers: Option<HashSet<String>>,
    buckets: Option<HashSet<String>>,
}

impl AccessPolicy {
    pub fn new(providers: Option<Vec<String>>, buckets: Option<Vec<String>>) -> Self {
        Self {
            providers: providers.map(|p| p.into_iter().collect()),
            buckets: buckets.map(|b| b.into_iter().collect()),
        }
    }

    pub fn provider_allowed(&self, provider: &str) -> bool {
        self.providers
            .as_ref()
            .is_none_or(|allowed| allowed.contains(provider))
    }

    pub fn bucket_allowed(&self, bucket: &str) -> bool {
        self.buckets
            .as_ref()
            .is_none_or(|allowed| allowed.contains(bucket))
    }

    /// Reject a request naming a provider or bucket outside the allowlists.
    pub fn authorize(&self, request: &Request) -> Result<(), Failure> {
        let (provider, bucket) = request.target();
        if let Some(provider) = provider.filter(|p| !self.provider_allowed(p)) {
            return Err(Failure::new(
                ErrorCode::Unauthorized,
                format!("provider {provider} is not allowed"),
            )
            .with_field("provider"));
        }
        if let Some(bucket) = bucket.filter(|b| !self.bucket_allowed(b)) {
            return Err(Failure::new(
                ErrorCode::Unauthorized,
                format!("bucket {bucket} is not allowed"),
            )
            .with_field("bucket"));
        }
        Ok(())
    }
}

/// The credential broker: validated requests in, response payloads out.
pub struct Broker {
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) flows: FlowRegistry,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) refresher: Arc<RefreshCoordinator>,
    pub(crate) policy: AccessPolicy,
    pub(crate) usage: UsageTracker,
}

impl Broker {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        keys: Arc<dyn KeyStore>,
        flows: FlowRegistry,
        settings: BrokerSettings,
    ) -> Self {
        info!(
            providers = ?flows.providers(),
            session_timeout_secs = settings.session_timeout.as_secs(),
            bind_sessions_to_peer = settings.bind_sessions_to_peer,
            "broker initialized"
        );
        Self {
            tokens,
            keys,
            flows,
            sessions: Arc::new(SessionStore::new(
                settings.session_timeout,
                settings.bind_sessions_to_peer,
            )),
            refresher: Arc::new(RefreshCoordinator::new(settings.refresh_cooldown)),
            policy: AccessPolicy::new(settings.allowed_providers, settings.allowed_buckets),
            usage: UsageTracker::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    /// Authorize and route one validated request.
    pub async fn handle(&self, request: Request, peer: &PeerIdentity) -> HandlerResult {
        if let Err(failure) = self.policy.authorize(&request) {
            debug!(op = request.op(), reason = %failure.message, "request not authorized");
            return Err(failure);
        }

        match request {
            Request::GetToken(target) => self.get_token(target).await,
            Request::SaveToken { target, token } => self.save_token(target, token).await,
            Request::RemoveToken(target) => self.remove_token(target).await,
            Request::ListProviders => self.list_providers().await,
            Request::ListBuckets { provider } => self.list_buckets(provider).await,
            Request::GetBucketStats(target) => self.get_bucket_stats(target).await,
            Request::GetApiKey { name } => self.get_api_key(name).await,
            Request::ListApiKeys => self.list_api_keys().await,
            Request::HasApiKey { name } => self.has_api_key(name).await,
            Request::OAuthInitiate(target) => self.oauth_initiate(target, peer).await,
            Request::OAuthExchange { session_id, code } => {
                self.oauth_exchange(&session_id, &code, peer).await
            }
            Request::OAuthPoll { session_id } => self.oauth_poll(&session_id, peer).await,
            Request::OAuthCancel { session_id } => self.oauth_cancel(&session_id, peer),
            Request::RefreshToken(target) => self.refresh_token(target).await,
        }
    }
}
