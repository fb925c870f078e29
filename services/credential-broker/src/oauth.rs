//! OAuth login handlers: initiate, exchange, poll, cancel
//!
//! A session is created by `oauth_initiate` and finished by exactly one of
//! `oauth_exchange` (PKCE redirect) or `oauth_poll` (device code, browser
//! redirect). The handler that wins the session's compare-and-set persists
//! the full token and tombstones the session; peers only ever see the
//! sanitized token.

use std::sync::Arc;

use provider::{ErrorClassification, FlowError, FlowType, OAuthToken, PollOutcome};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::dispatch::Broker;
use crate::peer::PeerIdentity;
use crate::protocol::{ErrorCode, Failure, HandlerResult};
use crate::session::{CompletionGuard, Lookup, OAuthSession};
use crate::validate::BucketRef;

/// Poll interval announced when a polled flow does not supply one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Added to the current interval when the provider says `slow_down` without
/// naming a new one (RFC 8628 §3.5).
pub const SLOW_DOWN_STEP_SECS: u64 = 5;

impl Broker {
    pub(crate) async fn oauth_initiate(
        &self,
        target: BucketRef,
        peer: &PeerIdentity,
    ) -> HandlerResult {
        let Some(flow) = self.flows.create(&target.provider) else {
            return Err(Failure::new(
                ErrorCode::ProviderNotConfigured,
                format!("no OAuth flow configured for provider {}", target.provider),
            ));
        };

        let initiation = flow.initiate().await.map_err(|e| {
            warn!(provider = %target.provider, error = %e, "flow initiation failed");
            Failure::new(
                ErrorCode::FlowInitiationFailed,
                format!("could not start login: {e}"),
            )
        })?;

        let flow_type = flow.flow_type();
        let interval = initiation
            .interval_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let session = self.sessions.insert(OAuthSession::new(
            target.provider,
            target.bucket,
            flow,
            initiation.device_code,
            initiation.state,
            interval,
            self.sessions.timeout(),
            peer.clone(),
        ));

        info!(
            session = %session.log_id(),
            provider = %session.provider,
            bucket = %session.bucket,
            flow_type = %flow_type,
            "login session started"
        );

        let mut data = json!({
            "session_id": session.id,
            "flow_type": flow_type,
            "expires_in": self.sessions.timeout().as_secs(),
        });
        let fields = [
            ("auth_url", initiation.auth_url),
            ("user_code", initiation.user_code),
            ("verification_uri", initiation.verification_uri),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                data[name] = Value::String(value);
            }
        }
        if flow_type.is_polled() {
            data["interval"] = json!(interval);
        }
        Ok(data)
    }

    pub(crate) async fn oauth_exchange(
        &self,
        session_id: &str,
        mut code: &str,
        peer: &PeerIdentity,
    ) -> HandlerResult {
        let session = self.live_session(session_id, peer)?;
        if session.flow_type != FlowType::PkceRedirect {
            return Err(Failure::invalid(
                "session_id",
                format!(
                    "session uses the {} flow; complete it with oauth_poll",
                    session.flow_type
                ),
            ));
        }
        if !session.mark_used() {
            return Err(already_used());
        }
        let guard = CompletionGuard::new(&self.sessions, &session.id);

        if let Some(expected) = &session.pkce_state {
            let (code_part, returned_state) = split_code(code);
            code = code_part;
            if returned_state.is_some_and(|returned| !expected.matches(returned)) {
                warn!(session = %session.log_id(), provider = %session.provider, "state mismatch on exchange");
                return Err(Failure::new(
                    ErrorCode::ExchangeFailed,
                    "authorization state does not match this session",
                ));
            }
        }

        let token = session.flow.exchange(code).await.map_err(|e| {
            warn!(
                session = %session.log_id(),
                provider = %session.provider,
                error = %e,
                "code exchange failed"
            );
            Failure::new(ErrorCode::ExchangeFailed, format!("code exchange failed: {e}"))
        })?;

        let peer_token = self.persist(&session, token).await?;
        guard.complete();
        info!(session = %session.log_id(), provider = %session.provider, bucket = %session.bucket, "login completed");
        Ok(json!({ "token": peer_token }))
    }

    pub(crate) async fn oauth_poll(&self, session_id: &str, peer: &PeerIdentity) -> HandlerResult {
        let session = self.live_session(session_id, peer)?;
        if !session.flow_type.is_polled() {
            return Err(Failure::invalid(
                "session_id",
                format!(
                    "session uses the {} flow; complete it with oauth_exchange",
                    session.flow_type
                ),
            ));
        }

        let device_code = session
            .device_code
            .as_ref()
            .or(session.pkce_state.as_ref())
            .map(|secret| secret.expose().as_str())
            .unwrap_or_default();

        match session.flow.poll(device_code).await {
            Ok(PollOutcome::Pending) => Ok(json!({ "status": "pending" })),
            Ok(PollOutcome::SlowDown { interval_secs }) => {
                let interval = interval_secs
                    .filter(|secs| *secs > 0)
                    .unwrap_or(session.interval_secs() + SLOW_DOWN_STEP_SECS);
                session.set_interval_secs(interval);
                info!(session = %session.log_id(), interval_secs = interval, "provider asked to slow down");
                Ok(json!({ "status": "pending", "interval": interval }))
            }
            Ok(PollOutcome::Complete(token)) => {
                if !session.mark_used() {
                    return Err(already_used());
                }
                let guard = CompletionGuard::new(&self.sessions, &session.id);
                let peer_token = self.persist(&session, token).await?;
                guard.complete();
                info!(session = %session.log_id(), provider = %session.provider, bucket = %session.bucket, "login completed");
                Ok(json!({ "status": "complete", "token": peer_token }))
            }
            Err(e) => Err(self.poll_failed(&session, e)),
        }
    }

    pub(crate) fn oauth_cancel(&self, session_id: &str, peer: &PeerIdentity) -> HandlerResult {
        let cancelled = self.sessions.cancel(session_id, peer);
        if cancelled {
            info!(session = %provider::pkce::fingerprint(session_id), "login session cancelled");
        }
        Ok(json!({ "cancelled": cancelled }))
    }

    fn live_session(
        &self,
        session_id: &str,
        peer: &PeerIdentity,
    ) -> Result<Arc<OAuthSession>, Failure> {
        match self.sessions.checkout(session_id, peer) {
            Lookup::Live(session) => Ok(session),
            Lookup::NotFound => Err(Failure::new(ErrorCode::SessionNotFound, "session not found")),
            Lookup::Expired => Err(Failure::new(ErrorCode::SessionExpired, "session expired")),
            Lookup::AlreadyUsed => Err(already_used()),
        }
    }

    /// Persist the full token, returning the sanitized copy for the peer.
    async fn persist(&self, session: &OAuthSession, token: OAuthToken) -> Result<Value, Failure> {
        let peer_token = token.to_peer_value();
        self.lock_bucket(&session.provider, &session.bucket).await?;
        let saved = self
            .tokens
            .save_token(&session.provider, &session.bucket, token)
            .await;
        self.unlock_bucket(&session.provider, &session.bucket).await;
        saved.map_err(|e| {
            warn!(session = %session.log_id(), error = %e, "failed to persist login token");
            Failure::from(e)
        })?;
        Ok(peer_token)
    }

    /// Map a poll error, ending the session unless the error is transient.
    fn poll_failed(&self, session: &OAuthSession, error: FlowError) -> Failure {
        let (code, terminal) = match &error {
            FlowError::AccessDenied(_) => (ErrorCode::AccessDenied, true),
            FlowError::Expired(_) => (ErrorCode::SessionExpired, true),
            e if e.classify() == ErrorClassification::Authentication => {
                (ErrorCode::ExchangeFailed, true)
            }
            _ => (ErrorCode::ExchangeFailed, false),
        };

        warn!(
            session = %session.log_id(),
            provider = %session.provider,
            error = %error,
            terminal,
            "poll failed"
        );
        if terminal && session.mark_used() {
            self.sessions.remove(&session.id);
        }
        Failure::new(code, format!("poll failed: {error}"))
    }
}

fn already_used() -> Failure {
    Failure::new(ErrorCode::SessionAlreadyUsed, "session already used")
}

/// Split a pasted `code#state` into its parts. Only meaningful for flows
/// that issued a state.
fn split_code(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('#') {
        Some((code, state)) => (code, Some(state)),
        None => (raw, None),
    }
}
