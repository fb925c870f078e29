//! Broker lifecycle state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Broker lifecycle states.
///
/// Fields marked `dead_code` are carried through transitions for logging and
/// debugging but never read independently.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config, opening stores
    Initializing,
    /// Creating the listening socket
    Binding { retries: u32, socket_path: PathBuf },
    /// Accepting connections
    Running {
        socket_path: PathBuf,
        started_at: Instant,
    },
    /// Accept loop stopped, finishing in-flight requests
    Draining {
        socket_path: PathBuf,
        deadline: Instant,
    },
    /// Terminal state
    Stopped { exit_code: i32 },
    /// Retryable bind failure, waiting for the retry timer
    Error {
        error: String,
        retries: u32,
        socket_path: PathBuf,
    },
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum ServiceEvent {
    /// Configuration parsed and stores opened
    ConfigLoaded { socket_path: PathBuf },
    /// Socket bound and chmod'ed
    Bound,
    /// Socket creation failed
    BindFailed { error: String, retryable: bool },
    /// Retry backoff expired
    RetryTimer,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every connection finished before the deadline
    ConnectionsDrained,
    /// Drain deadline exceeded
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceAction {
    /// Create the socket at the given path
    Bind { path: PathBuf },
    /// Start the accept loop
    Serve,
    /// Set retry timer
    ScheduleRetry { delay: Duration },
    /// Remove the socket and wait for connections, at most `timeout`
    Drain { timeout: Duration },
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Maximum bind retries before giving up
pub const MAX_BIND_RETRIES: u32 = 5;

/// How long shutdown waits for open connections
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { socket_path }) => (
            ServiceState::Binding {
                retries: 0,
                socket_path: socket_path.clone(),
            },
            ServiceAction::Bind { path: socket_path },
        ),

        // --- Binding ---
        (ServiceState::Binding { socket_path, .. }, ServiceEvent::Bound) => (
            ServiceState::Running {
                socket_path,
                started_at: Instant::now(),
            },
            ServiceAction::Serve,
        ),

        (
            ServiceState::Binding {
                retries,
                socket_path,
            },
            ServiceEvent::BindFailed {
                error,
                retryable: true,
            },
        ) if retries < MAX_BIND_RETRIES => {
            let delay = Duration::from_secs(2u64.pow(retries));
            (
                ServiceState::Error {
                    error,
                    retries,
                    socket_path,
                },
                ServiceAction::ScheduleRetry { delay },
            )
        }

        (ServiceState::Binding { .. }, ServiceEvent::BindFailed { .. }) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Error recovery ---
        (
            ServiceState::Error {
                retries,
                socket_path,
                ..
            },
            ServiceEvent::RetryTimer,
        ) => (
            ServiceState::Binding {
                retries: retries + 1,
                socket_path: socket_path.clone(),
            },
            ServiceAction::Bind { path: socket_path },
        ),

        // --- Running ---
        (ServiceState::Running { socket_path, .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                socket_path,
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::Drain {
                timeout: DRAIN_TIMEOUT,
            },
        ),

        // --- Draining ---
        (
            ServiceState::Draining { .. },
            ServiceEvent::ConnectionsDrained | ServiceEvent::DrainTimeout,
        ) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // A second signal while draining does not cut the drain short
        (state @ ServiceState::Draining { .. }, ServiceEvent::ShutdownSignal) => {
            (state, ServiceAction::None)
        }

        // --- Any other state + shutdown = stop ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
