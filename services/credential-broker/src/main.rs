//! Credential broker daemon
//!
//! Single binary that:
//! 1. Loads config and opens the token and API key files
//! 2. Binds a private Unix socket (retrying transient failures)
//! 3. Serves framed JSON requests from same-user peers
//! 4. On SIGINT/SIGTERM removes the socket and drains connections

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use credential_broker::config::Config;
use credential_broker::peer::{PeerVerifier, Strategy};
use credential_broker::server::{self, ConnectionContext};
use credential_broker::service::{ServiceAction, ServiceEvent, ServiceState, handle_event};
use credential_broker::{Broker, BrokerSettings, metrics, session, socket};
use credential_store::{FileKeyStore, FileTokenStore};
use provider::FlowRegistry;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often idle refresh state is evicted.
const REFRESH_EVICTION_INTERVAL: Duration = Duration::from_secs(300);

/// How often expired login sessions are swept.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr with LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting credential-broker");

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    let config = if explicit || config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!("no configuration file found, using defaults");
        Config::from_toml("").context("invalid configuration from environment")?
    };

    info!(
        socket_path = %config.broker.socket_path.display(),
        max_requests_per_second = config.broker.max_requests_per_second,
        peer_verification = ?config.broker.peer_verification,
        token_file = %config.storage.token_file.display(),
        "configuration loaded"
    );

    if let Some(addr) = config.metrics.listen_addr {
        metrics::install_exporter(addr)
            .with_context(|| format!("failed to start metrics exporter on {addr}"))?;
        info!(%addr, "prometheus exporter listening");
    }

    create_private_parent(&config.storage.token_file).await?;
    create_private_parent(&config.storage.key_file).await?;
    let tokens = FileTokenStore::load(config.storage.token_file.clone())
        .await
        .with_context(|| {
            format!("failed to open token file {}", config.storage.token_file.display())
        })?;
    let keys = FileKeyStore::load(config.storage.key_file.clone())
        .await
        .with_context(|| format!("failed to open key file {}", config.storage.key_file.display()))?;

    // Provider wire clients are registered by embedders; the stock binary
    // serves stored credentials and reports logins as not configured.
    let flows = FlowRegistry::new();
    if flows.is_empty() {
        warn!("no OAuth flows registered; oauth_* and refresh_token will report PROVIDER_NOT_CONFIGURED");
    }

    let broker = Arc::new(Broker::new(
        Arc::new(tokens),
        Arc::new(keys),
        flows,
        BrokerSettings::from(&config.broker),
    ));
    let eviction = refresh::spawn_eviction_task(broker.refresher().clone(), REFRESH_EVICTION_INTERVAL);
    let sweep = session::spawn_sweep_task(broker.sessions().clone(), SESSION_SWEEP_INTERVAL);

    let strategy = Strategy::select(config.broker.peer_verification);
    info!(strategy = strategy.as_str(), "peer verification selected");
    let verifier = Arc::new(PeerVerifier::new(strategy));

    // Transition: Initializing -> Binding
    let (new_state, mut action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            socket_path: config.broker.socket_path.clone(),
        },
    );
    state = new_state;

    // Execute Bind / ScheduleRetry actions until bound or stopped
    let listener = loop {
        match action {
            ServiceAction::Bind { path } => match socket::bind(&path).await {
                Ok(listener) => {
                    let (new_state, _) = handle_event(state, ServiceEvent::Bound);
                    state = new_state;
                    break listener;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    error!(path = %path.display(), error = %e, retryable, "socket bind failed");
                    let (new_state, next) = handle_event(
                        state,
                        ServiceEvent::BindFailed {
                            error: e.to_string(),
                            retryable,
                        },
                    );
                    state = new_state;
                    action = next;
                }
            },
            ServiceAction::ScheduleRetry { delay } => {
                warn!(retry_in_secs = delay.as_secs(), "retrying socket bind");
                tokio::time::sleep(delay).await;
                let (new_state, next) = handle_event(state, ServiceEvent::RetryTimer);
                state = new_state;
                action = next;
            }
            ServiceAction::Shutdown { exit_code } => {
                error!(exit_code, "could not create socket, exiting");
                std::process::exit(exit_code);
            }
            other => anyhow::bail!("unexpected action while binding: {other:?}"),
        }
    };

    let socket_path = config.broker.socket_path.clone();
    info!(path = %socket_path.display(), "state: Running, accepting connections");

    let ctx = Arc::new(ConnectionContext {
        broker,
        verifier,
        max_requests_per_second: config.broker.max_requests_per_second,
        max_frame_bytes: config.broker.max_frame_bytes,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_loop = tokio::spawn(server::run(listener, ctx, shutdown_rx));

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let ServiceAction::Drain { timeout } = action else {
        anyhow::bail!("unexpected action after shutdown signal: {action:?}");
    };

    let _ = shutdown_tx.send(true);
    socket::cleanup(&socket_path);
    let connections = accept_loop.await.context("accept loop panicked")?;

    let remaining = server::drain(connections, timeout).await;
    let event = if remaining == 0 {
        info!("all connections drained");
        ServiceEvent::ConnectionsDrained
    } else {
        warn!(
            remaining,
            drain_timeout_secs = timeout.as_secs(),
            "drain timeout exceeded, aborting connections"
        );
        ServiceEvent::DrainTimeout
    };

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, event);
    eviction.abort();
    sweep.abort();
    info!(?action, "shutdown complete");
    Ok(())
}

/// Create the directory holding a store file, private to the user.
async fn create_private_parent(file: &Path) -> Result<()> {
    let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
