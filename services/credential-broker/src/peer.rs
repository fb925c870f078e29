//! Peer identity verification
//!
//! The strategy is chosen once at startup from config and platform support:
//!
//! - `UidCheck`: the peer's uid must equal the broker's effective uid
//! - `PidLogOnly`: the peer pid is logged, never used to reject
//! - `Unavailable`: no check (verification disabled or unsupported)
//!
//! Verification runs right after accept, before any frame is read.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::config::PeerVerification;

/// Which credential the identity was verified against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Uid,
    Pid,
    Unknown,
}

/// Identity of a connected peer, captured once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub kind: PeerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl PeerIdentity {
    pub fn unknown() -> Self {
        Self {
            kind: PeerKind::Unknown,
            uid: None,
            pid: None,
        }
    }

    /// Whether `other` is the same principal, for session binding.
    ///
    /// Compares pids when both are known, else uids. Identities with nothing
    /// to compare are treated as the same.
    pub fn same_principal(&self, other: &PeerIdentity) -> bool {
        match ((self.pid, other.pid), (self.uid, other.uid)) {
            ((Some(a), Some(b)), _) => a == b,
            (_, (Some(a), Some(b))) => a == b,
            _ => true,
        }
    }
}

/// Verification strategy, selected once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    UidCheck,
    PidLogOnly,
    Unavailable,
}

impl Strategy {
    /// Strategy for a configured setting on this platform.
    pub fn select(setting: PeerVerification) -> Self {
        match setting {
            PeerVerification::Off => Strategy::Unavailable,
            PeerVerification::PidLogOnly => Strategy::PidLogOnly,
            PeerVerification::Auto | PeerVerification::Uid if cfg!(unix) => Strategy::UidCheck,
            PeerVerification::Auto | PeerVerification::Uid => Strategy::Unavailable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::UidCheck => "uid-check",
            Strategy::PidLogOnly => "pid-log-only",
            Strategy::Unavailable => "unavailable",
        }
    }
}

/// Result of verifying a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow(PeerIdentity),
    Reject { reason: String },
}

/// Raw credentials read from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCredentials {
    pub uid: u32,
    pub pid: Option<i32>,
}

pub struct PeerVerifier {
    strategy: Strategy,
    broker_uid: u32,
    warned_unreadable: AtomicBool,
}

impl PeerVerifier {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_uid(strategy, effective_uid())
    }

    pub fn with_uid(strategy: Strategy, broker_uid: u32) -> Self {
        Self {
            strategy,
            broker_uid,
            warned_unreadable: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Verify an accepted connection.
    pub fn verify(&self, stream: &UnixStream) -> Verdict {
        if self.strategy == Strategy::Unavailable {
            return Verdict::Allow(PeerIdentity::unknown());
        }
        let creds = stream
            .peer_cred()
            .map(|c| RawCredentials {
                uid: c.uid(),
                pid: c.pid(),
            })
            .map_err(|e| e.to_string());
        self.evaluate(creds)
    }

    /// Decide on credentials already read from the socket.
    pub fn evaluate(&self, creds: Result<RawCredentials, String>) -> Verdict {
        let creds = match creds {
            Ok(creds) => creds,
            Err(e) => {
                if !self.warned_unreadable.swap(true, Ordering::Relaxed) {
                    warn!(
                        strategy = self.strategy.as_str(),
                        error = %e,
                        "peer credentials unavailable, allowing connections without verification"
                    );
                }
                return Verdict::Allow(PeerIdentity::unknown());
            }
        };

        match self.strategy {
            Strategy::UidCheck if creds.uid != self.broker_uid => Verdict::Reject {
                reason: format!(
                    "peer uid {} does not match broker uid {}",
                    creds.uid, self.broker_uid
                ),
            },
            Strategy::UidCheck => Verdict::Allow(PeerIdentity {
                kind: PeerKind::Uid,
                uid: Some(creds.uid),
                pid: creds.pid,
            }),
            Strategy::PidLogOnly => {
                debug!(peer_pid = ?creds.pid, peer_uid = creds.uid, "peer connected");
                Verdict::Allow(PeerIdentity {
                    kind: PeerKind::Pid,
                    uid: Some(creds.uid),
                    pid: creds.pid,
                })
            }
            Strategy::Unavailable => Verdict::Allow(PeerIdentity::unknown()),
        }
    }
}

/// Effective uid of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
