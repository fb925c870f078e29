//! Refresh coordination for stored OAuth tokens
//!
//! The broker refreshes tokens on request. Several peers often ask for the same
//! `(provider, bucket)` at once, and providers punish hammering their token
//! endpoint, so every refresh goes through a `RefreshCoordinator`:
//!
//! 1. A refresh already running for the key → callers join it and share its result
//! 2. A refresh started within the cooldown window → `RateLimited` with the remaining wait
//! 3. Otherwise the attempt time is recorded, then the refresh body runs on its own task
//! 4. Transient failures stretch the cooldown exponentially; success resets it
//! 5. Idle per-key state is evicted by a background task
//!
//! Provider errors are mapped to `RefreshError` by `classify`, which separates
//! dead grants (`ReauthRequired`) from transient failures.

pub mod classify;
pub mod coordinator;
pub mod error;
pub mod eviction;

pub use classify::classify_flow_error;
pub use coordinator::{DEFAULT_COOLDOWN, MAX_BACKOFF, RefreshCoordinator};
pub use error::{RefreshError, Result};
pub use eviction::spawn_eviction_task;
