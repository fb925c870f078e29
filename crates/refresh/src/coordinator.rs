//! Cooldown and single-flight state per `provider:bucket`
//!
//! Each key has a small state record: when the last attempt started, the
//! shared handle of a refresh still running, and how many transient failures
//! happened in a row. The record is guarded by a std Mutex that is never held
//! across an await; the refresh body itself runs on a spawned task so a caller
//! that goes away cannot strand the joiners.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use provider::OAuthToken;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RefreshError, Result};

/// Default minimum spacing between two refreshes of the same key.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Upper bound for the backoff after repeated transient failures.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

type SharedRefresh = Shared<BoxFuture<'static, Result<OAuthToken>>>;

#[derive(Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
    in_flight: Option<SharedRefresh>,
    failures: u32,
    generation: u64,
}

type States = Arc<Mutex<HashMap<String, RefreshState>>>;

/// Coordinates refreshes so each key sees at most one provider call at a time
/// and no more than one attempt per cooldown window.
pub struct RefreshCoordinator {
    states: States,
    cooldown: Duration,
}

impl RefreshCoordinator {
    pub fn new(cooldown: Duration) -> Self {
        info!(cooldown_secs = cooldown.as_secs(), "refresh coordinator initialized");
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Refresh `(provider, bucket)` through `do_refresh`, deduplicated and rate limited.
    ///
    /// `do_refresh` is only invoked when no refresh is running for the key and
    /// the cooldown has passed. The token it returns (merged and persisted by
    /// the body) is handed back sanitized to the caller and every joiner.
    pub async fn refresh<F, Fut>(
        &self,
        provider: &str,
        bucket: &str,
        do_refresh: F,
    ) -> Result<OAuthToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OAuthToken>> + Send + 'static,
    {
        let key = state_key(provider, bucket);

        let shared = {
            let mut states = lock(&self.states);
            let state = states.entry(key.clone()).or_default();

            if let Some(in_flight) = &state.in_flight {
                debug!(provider, bucket, "joining in-flight refresh");
                metrics::counter!("broker_refresh_total", "outcome" => "joined").increment(1);
                in_flight.clone()
            } else {
                let now = Instant::now();
                if let Some(last) = state.last_attempt {
                    let window = backoff_window(self.cooldown, state.failures);
                    let elapsed = now.saturating_duration_since(last);
                    if elapsed < window {
                        let retry_after = window - elapsed;
                        debug!(
                            provider,
                            bucket,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "refresh within cooldown"
                        );
                        metrics::counter!("broker_refresh_total", "outcome" => "rate_limited")
                            .increment(1);
                        return Err(RefreshError::RateLimited { retry_after });
                    }
                }

                // Recorded before the outcome is known so a near-simultaneous
                // second caller sees this attempt.
                state.last_attempt = Some(now);
                state.generation += 1;
                let generation = state.generation;

                let body = do_refresh();
                let states = self.states.clone();
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let result = body.await.map(|token| token.sanitized());
                    settle(&states, &task_key, generation, &result);
                    result
                });

                let states = self.states.clone();
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            let result =
                                Err(RefreshError::Failed(format!("refresh task failed: {e}")));
                            settle(&states, &key, generation, &result);
                            result
                        }
                    }
                }
                .boxed()
                .shared();

                state.in_flight = Some(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Drop state for keys that are idle and past their window.
    ///
    /// Returns the number of evicted keys.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut states = lock(&self.states);
        let before = states.len();
        states.retain(|_, state| {
            if state.in_flight.is_some() {
                return true;
            }
            match state.last_attempt {
                Some(last) => {
                    let window = backoff_window(self.cooldown, state.failures);
                    now.saturating_duration_since(last) < window
                }
                None => false,
            }
        });
        before - states.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.states).len()
    }

    /// Start instant of the last attempt for the key, if any.
    pub fn last_attempt(&self, provider: &str, bucket: &str) -> Option<Instant> {
        lock(&self.states)
            .get(&state_key(provider, bucket))
            .and_then(|state| state.last_attempt)
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

fn state_key(provider: &str, bucket: &str) -> String {
    format!("{provider}:{bucket}")
}

fn lock(
    states: &Mutex<HashMap<String, RefreshState>>,
) -> MutexGuard<'_, HashMap<String, RefreshState>> {
    states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cooldown stretched by consecutive transient failures: cooldown × 2^(failures−1),
/// capped at `MAX_BACKOFF` (never below the plain cooldown).
fn backoff_window(cooldown: Duration, failures: u32) -> Duration {
    if failures <= 1 {
        return cooldown;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    cooldown
        .checked_mul(factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
        .max(cooldown)
}

/// Clear the in-flight slot and record the outcome, unless a newer attempt
/// already owns the key.
fn settle(states: &States, key: &str, generation: u64, result: &Result<OAuthToken>) {
    let mut states = lock(states);
    let Some(state) = states.get_mut(key) else {
        return;
    };
    if state.generation != generation {
        return;
    }
    state.in_flight = None;

    let outcome = match result {
        Ok(_) => {
            state.failures = 0;
            info!(key, "token refresh succeeded");
            "success"
        }
        Err(e) if e.is_transient() => {
            state.failures = state.failures.saturating_add(1);
            warn!(key, failures = state.failures, error = %e, "token refresh failed (transient)");
            "failed"
        }
        Err(RefreshError::ReauthRequired(msg)) => {
            warn!(key, error = %msg, "refresh grant rejected, re-authentication required");
            "reauth_required"
        }
        Err(e) => {
            debug!(key, error = %e, "token refresh ended without a provider call");
            "skipped"
        }
    };
    metrics::counter!("broker_refresh_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn refreshed(access: &str) -> OAuthToken {
        OAuthToken::new(access).with_refresh_token("rt_new")
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let coordinator = Arc::new(RefreshCoordinator::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh("gemini", "default", move || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(refreshed(&format!("at_{n}")))
                    })
                    .await
            }));
        }

        let mut results = vec![];
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|t| t == &results[0]));
        assert_eq!(results[0].access_token, "at_0");
    }

    #[tokio::test(start_paused = true)]
    async fn result_is_sanitized() {
        let coordinator = RefreshCoordinator::default();
        let token = coordinator
            .refresh("gemini", "default", || async { Ok(refreshed("at")) })
            .await
            .unwrap();
        assert_eq!(token.access_token, "at");
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_rate_limits_without_calling_body() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(30));
        coordinator
            .refresh("qwen", "default", || async { Ok(refreshed("first")) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let err = coordinator
            .refresh("qwen", "default", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(refreshed("second"))
            })
            .await
            .unwrap_err();

        match err {
            RefreshError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(called.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        let token = coordinator
            .refresh("qwen", "default", || async { Ok(refreshed("third")) })
            .await
            .unwrap();
        assert_eq!(token.access_token, "third");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let coordinator = RefreshCoordinator::default();
        coordinator
            .refresh("qwen", "work", || async { Ok(refreshed("w")) })
            .await
            .unwrap();
        let token = coordinator
            .refresh("qwen", "personal", || async { Ok(refreshed("p")) })
            .await
            .unwrap();
        assert_eq!(token.access_token, "p");
    }

    #[tokio::test(start_paused = true)]
    async fn reauth_error_is_shared_and_not_backed_off() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(30));
        let err = coordinator
            .refresh("anthropic", "default", || async {
                Err(RefreshError::ReauthRequired("invalid_grant".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::ReauthRequired(_)));

        // Plain cooldown applies, no exponential stretch.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(
            coordinator
                .refresh("anthropic", "default", || async { Ok(refreshed("ok")) })
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(10));
        let fail = || async { Err(RefreshError::Failed("503".into())) };

        // First failure: window 10s.
        coordinator.refresh("p", "b", fail).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        // Second failure: window 20s.
        coordinator.refresh("p", "b", fail).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;
        match coordinator.refresh("p", "b", fail).await.unwrap_err() {
            RefreshError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(10))
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        coordinator
            .refresh("p", "b", || async { Ok(refreshed("recovered")) })
            .await
            .unwrap();

        // Success resets to the plain cooldown.
        tokio::time::advance(Duration::from_secs(10)).await;
        let err = coordinator.refresh("p", "b", fail).await.unwrap_err();
        assert!(matches!(err, RefreshError::Failed(_)));
    }

    #[test]
    fn backoff_window_is_capped() {
        let cooldown = Duration::from_secs(30);
        assert_eq!(backoff_window(cooldown, 0), cooldown);
        assert_eq!(backoff_window(cooldown, 1), cooldown);
        assert_eq!(backoff_window(cooldown, 2), Duration::from_secs(60));
        assert_eq!(backoff_window(cooldown, 3), Duration::from_secs(120));
        assert_eq!(backoff_window(cooldown, 5), MAX_BACKOFF);
        assert_eq!(backoff_window(cooldown, 40), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_is_recorded_before_completion() {
        let coordinator = Arc::new(RefreshCoordinator::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let c = coordinator.clone();
        let leader = tokio::spawn(async move {
            c.refresh("gemini", "default", move || async move {
                let _ = rx.await;
                Ok(refreshed("slow"))
            })
            .await
        });

        tokio::task::yield_now().await;
        assert!(coordinator.last_attempt("gemini", "default").is_some());

        tx.send(()).unwrap();
        leader.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_does_not_strand_joiners() {
        let coordinator = Arc::new(RefreshCoordinator::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let c = coordinator.clone();
        let n = calls.clone();
        let leader = tokio::spawn(async move {
            c.refresh("gemini", "default", move || async move {
                n.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(refreshed("done"))
            })
            .await
        });
        tokio::task::yield_now().await;
        leader.abort();

        let token = coordinator
            .refresh("gemini", "default", || async { Ok(refreshed("unused")) })
            .await
            .unwrap();
        assert_eq!(token.access_token, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_drops_only_expired_keys() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(30));
        coordinator
            .refresh("a", "default", || async { Ok(refreshed("a")) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        coordinator
            .refresh("b", "default", || async { Ok(refreshed("b")) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(coordinator.evict_idle(), 1);
        assert_eq!(coordinator.tracked_keys(), 1);
        assert!(coordinator.last_attempt("a", "default").is_none());
        assert!(coordinator.last_attempt("b", "default").is_some());
    }
}
