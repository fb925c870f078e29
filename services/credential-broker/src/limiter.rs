//! Per-connection request throttling
//!
//! Sliding one-second window over request arrival instants. The limiter is
//! owned by the connection's read loop, so it needs no synchronization.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Milliseconds until the oldest request leaves the window (1..=1000).
    Deny { retry_after_ms: u64 },
}

#[derive(Debug)]
pub struct ConnectionRateLimiter {
    max_requests: usize,
    hits: VecDeque<Instant>,
}

impl ConnectionRateLimiter {
    pub fn new(max_requests: usize) -> Self {
        Self {
            max_requests,
            hits: VecDeque::with_capacity(max_requests.min(1024)),
        }
    }

    /// Check and record a request arriving now.
    pub fn check_limit(&mut self) -> Decision {
        self.check_at(Instant::now())
    }

    /// Check and record a request arriving at `now`. Denied requests are not
    /// recorded.
    pub fn check_at(&mut self, now: Instant) -> Decision {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        match self.hits.front() {
            Some(&oldest) if self.hits.len() >= self.max_requests => {
                let remaining = WINDOW.saturating_sub(now.saturating_duration_since(oldest));
                let millis = remaining.as_nanos().div_ceil(1_000_000) as u64;
                Decision::Deny {
                    retry_after_ms: millis.clamp(1, WINDOW.as_millis() as u64),
                }
            }
            _ => {
                self.hits.push_back(now);
                Decision::Allow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sixty_first_request_in_window_is_denied() {
        let mut limiter = ConnectionRateLimiter::new(60);
        for i in 0..60 {
            assert_eq!(limiter.check_limit(), Decision::Allow, "request {i}");
        }
        match limiter.check_limit() {
            Decision::Deny { retry_after_ms } => {
                assert!((1..=1000).contains(&retry_after_ms), "{retry_after_ms}");
            }
            Decision::Allow => panic!("61st request must be denied"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over() {
        let mut limiter = ConnectionRateLimiter::new(60);
        for _ in 0..60 {
            limiter.check_limit();
        }
        assert!(matches!(limiter.check_limit(), Decision::Deny { .. }));

        tokio::time::advance(WINDOW).await;
        for i in 0..60 {
            assert_eq!(limiter.check_limit(), Decision::Allow, "request {i} after roll");
        }
    }

    #[test]
    fn retry_after_reflects_oldest_request() {
        let start = Instant::now();
        let mut limiter = ConnectionRateLimiter::new(2);
        assert_eq!(limiter.check_at(start), Decision::Allow);
        assert_eq!(
            limiter.check_at(start + Duration::from_millis(300)),
            Decision::Allow
        );
        assert_eq!(
            limiter.check_at(start + Duration::from_millis(400)),
            Decision::Deny { retry_after_ms: 600 }
        );
        // Oldest has left the window at +1000ms
        assert_eq!(
            limiter.check_at(start + Duration::from_millis(1000)),
            Decision::Allow
        );
        assert_eq!(
            limiter.check_at(start + Duration::from_millis(1000)),
            Decision::Deny { retry_after_ms: 300 }
        );
    }

    #[test]
    fn retry_after_is_at_least_one_millisecond() {
        let start = Instant::now();
        let mut limiter = ConnectionRateLimiter::new(1);
        limiter.check_at(start);
        let decision = limiter.check_at(start + Duration::from_micros(999_900));
        assert_eq!(decision, Decision::Deny { retry_after_ms: 1 });
    }

    #[test]
    fn denied_requests_do_not_extend_the_window() {
        let start = Instant::now();
        let mut limiter = ConnectionRateLimiter::new(1);
        limiter.check_at(start);
        for ms in [100, 200, 900] {
            assert!(matches!(
                limiter.check_at(start + Duration::from_millis(ms)),
                Decision::Deny { .. }
            ));
        }
        assert_eq!(
            limiter.check_at(start + Duration::from_secs(1)),
            Decision::Allow
        );
    }
}
