//! OAuth login session arena
//!
//! Sessions live in a map keyed by an unguessable id. Completion is decided
//! by a compare-and-set on `used`, so concurrent exchange/poll completions
//! (and the expiry sweep) resolve to exactly one winner without a global
//! lock held across provider calls.
//!
//! A session that completed successfully is replaced by a tombstone until its
//! original expiry, so a replay answers "already used" rather than "not
//! found". Failed sessions are removed outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::Secret;
use provider::pkce::{fingerprint, random_urlsafe};
use provider::{FlowType, OAuthFlow};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::peer::PeerIdentity;

/// Bytes of randomness in a session id.
const SESSION_ID_BYTES: usize = 32;

/// A pending OAuth login.
pub struct OAuthSession {
    pub id: String,
    pub provider: String,
    pub bucket: String,
    pub flow_type: FlowType,
    pub flow: Arc<dyn OAuthFlow>,
    pub device_code: Option<Secret<String>>,
    pub pkce_state: Option<Secret<String>>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub peer: PeerIdentity,
    used: AtomicBool,
    interval_secs: AtomicU64,
}

impl OAuthSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: String,
        bucket: String,
        flow: Arc<dyn OAuthFlow>,
        device_code: Option<Secret<String>>,
        pkce_state: Option<Secret<String>>,
        interval_secs: u64,
        timeout: Duration,
        peer: PeerIdentity,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            id: new_session_id(),
            provider,
            bucket,
            flow_type: flow.flow_type(),
            flow,
            device_code,
            pkce_state,
            created_at,
            expires_at: created_at + timeout,
            peer,
            used: AtomicBool::new(false),
            interval_secs: AtomicU64::new(interval_secs),
        }
    }

    /// Claim the session. Exactly one caller ever gets `true`.
    pub fn mark_used(&self) -> bool {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    pub fn set_interval_secs(&self, secs: u64) {
        self.interval_secs.store(secs, Ordering::Relaxed);
    }

    /// Seconds left before expiry.
    pub fn expires_in(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }

    /// Short fingerprint of the id for log lines.
    pub fn log_id(&self) -> String {
        fingerprint(&self.id)
    }
}

impl std::fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("id", &self.log_id())
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("flow_type", &self.flow_type)
            .field("used", &self.is_used())
            .finish()
    }
}

/// Fresh unguessable session id (URL-safe base64 of 32 random bytes).
pub fn new_session_id() -> String {
    random_urlsafe(SESSION_ID_BYTES)
}

enum Slot {
    Live(Arc<OAuthSession>),
    Consumed {
        expires_at: Instant,
        owner: PeerIdentity,
    },
}

/// Result of looking a session up for a session operation.
#[derive(Debug)]
pub enum Lookup {
    Live(Arc<OAuthSession>),
    NotFound,
    Expired,
    AlreadyUsed,
}

/// Map of login sessions.
pub struct SessionStore {
    slots: Mutex<HashMap<String, Slot>>,
    timeout: Duration,
    bind_to_peer: bool,
}

impl SessionStore {
    pub fn new(timeout: Duration, bind_to_peer: bool) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
            bind_to_peer,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, session: OAuthSession) -> Arc<OAuthSession> {
        let session = Arc::new(session);
        let mut slots = self.slots();
        slots.insert(session.id.clone(), Slot::Live(session.clone()));
        report_active(&slots);
        session
    }

    /// Whether a session owned by `owner` must look absent to `peer`.
    fn hidden_from(&self, owner: &PeerIdentity, peer: &PeerIdentity) -> bool {
        self.bind_to_peer && !owner.same_principal(peer)
    }

    /// Look up a session for exchange/poll, expiring it if its time is up.
    pub fn checkout(&self, id: &str, peer: &PeerIdentity) -> Lookup {
        let now = Instant::now();
        let mut slots = self.slots();
        let lookup = match slots.get(id) {
            None => Lookup::NotFound,
            Some(Slot::Consumed { expires_at, .. }) if now >= *expires_at => {
                slots.remove(id);
                Lookup::NotFound
            }
            Some(Slot::Consumed { owner, .. }) if self.hidden_from(owner, peer) => {
                Lookup::NotFound
            }
            Some(Slot::Consumed { .. }) => Lookup::AlreadyUsed,
            Some(Slot::Live(session)) if self.hidden_from(&session.peer, peer) => {
                debug!(session = %session.log_id(), "session requested by a different peer");
                Lookup::NotFound
            }
            Some(Slot::Live(session)) if session.is_used() => Lookup::AlreadyUsed,
            Some(Slot::Live(session)) if session.is_expired(now) => {
                info!(session = %session.log_id(), provider = %session.provider, "login session expired");
                slots.remove(id);
                report_active(&slots);
                Lookup::Expired
            }
            Some(Slot::Live(session)) => Lookup::Live(session.clone()),
        };
        lookup
    }

    /// Replace a completed session with a tombstone.
    pub fn complete(&self, id: &str) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(id) {
            if let Slot::Live(session) = slot {
                let expires_at = session.expires_at;
                let owner = session.peer.clone();
                *slot = Slot::Consumed { expires_at, owner };
            }
            report_active(&slots);
        }
    }

    /// Drop a session (failure paths). Returns whether a live session was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut slots = self.slots();
        let removed = matches!(slots.remove(id), Some(Slot::Live(_)));
        if removed {
            report_active(&slots);
        }
        removed
    }

    /// Cancel a live session on behalf of `peer`.
    pub fn cancel(&self, id: &str, peer: &PeerIdentity) -> bool {
        let mut slots = self.slots();
        let cancellable = match slots.get(id) {
            Some(Slot::Live(session)) => {
                !session.is_used() && !self.hidden_from(&session.peer, peer)
            }
            _ => false,
        };
        if cancellable {
            slots.remove(id);
            report_active(&slots);
        }
        cancellable
    }

    /// Remove expired sessions and tombstones.
    ///
    /// A live session is only removed if the sweep wins the same
    /// compare-and-set a completion uses; a session mid-completion is left to
    /// its handler.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Consumed { expires_at, .. } => now < *expires_at,
            Slot::Live(session) => !(session.is_expired(now) && session.mark_used()),
        });
        let swept = before - slots.len();
        if swept > 0 {
            report_active(&slots);
        }
        swept
    }

    /// Number of live (not yet consumed) sessions.
    pub fn active(&self) -> usize {
        count_live(&self.slots())
    }
}

fn count_live(slots: &HashMap<String, Slot>) -> usize {
    slots
        .values()
        .filter(|slot| matches!(slot, Slot::Live(_)))
        .count()
}

fn report_active(slots: &HashMap<String, Slot>) {
    crate::metrics::set_sessions_active(count_live(slots));
}

/// Removes the session on drop unless completed.
///
/// Held by a handler across the provider call after it claimed the session,
/// so a failed, panicked or cancelled completion never leaves a replayable
/// session behind.
pub struct CompletionGuard<'a> {
    store: &'a SessionStore,
    id: String,
    armed: bool,
}

impl<'a> CompletionGuard<'a> {
    pub fn new(store: &'a SessionStore, id: &str) -> Self {
        Self {
            store,
            id: id.to_string(),
            armed: true,
        }
    }

    /// Tombstone the session and disarm.
    pub fn complete(mut self) {
        self.store.complete(&self.id);
        self.armed = false;
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.remove(&self.id);
        }
    }
}

/// Spawn a background task that sweeps expired sessions every `interval`.
pub fn spawn_sweep_task(
    store: Arc<SessionStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let swept = store.sweep();
            if swept > 0 {
                debug!(swept, active = store.active(), "swept expired login sessions");
            }
        }
    })
}
