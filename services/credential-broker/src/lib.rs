//! Local OAuth credential broker
//!
//! Holds OAuth tokens and API keys on behalf of same-user processes and
//! serves them over a Unix socket using length-prefixed JSON frames. Peers
//! never see a refresh credential: logins, refreshes and persistence happen
//! inside the broker.
//!
//! Request path: `server` (framing, rate limit) → `validate` (schema) →
//! `dispatch` (allowlists, routing) → `oauth` / `tokens` (handlers).

pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod oauth;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod socket;
pub mod tokens;
pub mod validate;

#[cfg(test)]
mod testing;

pub use dispatch::{Broker, BrokerSettings};
