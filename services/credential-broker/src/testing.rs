//! Test doubles shared by the broker's unit and end-to-end tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Secret;
use credential_store::{FileKeyStore, FileTokenStore, KeyStore, TokenStore};
use provider::{
    FlowError, FlowFuture, FlowInitiation, FlowRegistry, FlowType, OAuthFlow, OAuthToken,
    PollOutcome,
};
use tempfile::TempDir;

use crate::dispatch::{Broker, BrokerSettings};
use crate::peer::{PeerIdentity, PeerKind, effective_uid};

/// Device code handed out by scripted device flows.
pub const DEVICE_CODE: &str = "dc-scripted-0001";
/// PKCE state handed out by scripted redirect flows.
pub const PKCE_STATE: &str = "state-scripted-0001";

#[derive(Default)]
struct Queues {
    initiate_error: Option<FlowError>,
    stateless: bool,
    exchange: VecDeque<Result<OAuthToken, FlowError>>,
    poll: VecDeque<Result<PollOutcome, FlowError>>,
    refresh: VecDeque<Result<OAuthToken, FlowError>>,
    exchange_codes: Vec<String>,
    poll_codes: Vec<String>,
    refresh_tokens: Vec<String>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Queues>,
    delay: Mutex<Option<Duration>>,
    exchange_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

/// Script for a fake OAuth flow. Every flow created from one script shares
/// its queues and counters, so tests can observe calls made through the
/// registry.
#[derive(Clone)]
pub struct Script {
    flow_type: FlowType,
    shared: Arc<Shared>,
}

impl Script {
    pub fn new(flow_type: FlowType) -> Self {
        Self {
            flow_type,
            shared: Arc::default(),
        }
    }

    pub fn pkce() -> Self {
        Self::new(FlowType::PkceRedirect)
    }

    pub fn device_code() -> Self {
        Self::new(FlowType::DeviceCode)
    }

    pub fn browser() -> Self {
        Self::new(FlowType::BrowserRedirect)
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.shared.queues.lock().unwrap()
    }

    pub fn fail_initiate(&self, error: FlowError) -> &Self {
        self.queues().initiate_error = Some(error);
        self
    }

    /// Redirect initiations hand out no `state`.
    pub fn without_state(&self) -> &Self {
        self.queues().stateless = true;
        self
    }

    pub fn on_exchange(&self, result: Result<OAuthToken, FlowError>) -> &Self {
        self.queues().exchange.push_back(result);
        self
    }

    pub fn on_poll(&self, result: Result<PollOutcome, FlowError>) -> &Self {
        self.queues().poll.push_back(result);
        self
    }

    pub fn on_refresh(&self, result: Result<OAuthToken, FlowError>) -> &Self {
        self.queues().refresh.push_back(result);
        self
    }

    /// Delay every provider call (exchange, poll, refresh).
    pub fn with_delay(&self, delay: Duration) -> &Self {
        *self.shared.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn exchange_calls(&self) -> usize {
        self.shared.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.shared.poll_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.shared.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_codes(&self) -> Vec<String> {
        self.queues().exchange_codes.clone()
    }

    pub fn poll_codes(&self) -> Vec<String> {
        self.queues().poll_codes.clone()
    }

    pub fn refresh_tokens(&self) -> Vec<String> {
        self.queues().refresh_tokens.clone()
    }

    pub fn flow(&self) -> Arc<dyn OAuthFlow> {
        Arc::new(ScriptedFlow {
            script: self.clone(),
        })
    }

    async fn pause(&self) {
        let delay = *self.shared.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

struct ScriptedFlow {
    script: Script,
}

impl OAuthFlow for ScriptedFlow {
    fn flow_type(&self) -> FlowType {
        self.script.flow_type
    }

    fn initiate(&self) -> FlowFuture<'_, FlowInitiation> {
        Box::pin(async move {
            let (initiate_error, stateless) = {
                let queues = self.script.queues();
                (queues.initiate_error.clone(), queues.stateless)
            };
            if let Some(err) = initiate_error {
                return Err(err);
            }
            let state = (!stateless).then(|| Secret::new(PKCE_STATE.to_string()));
            let initiation = match self.script.flow_type {
                FlowType::PkceRedirect => FlowInitiation {
                    auth_url: Some(format!(
                        "https://auth.example/authorize?state={PKCE_STATE}"
                    )),
                    state: state.clone(),
                    ..Default::default()
                },
                FlowType::DeviceCode => FlowInitiation {
                    user_code: Some("WDJB-MJHT".into()),
                    verification_uri: Some("https://auth.example/device".into()),
                    interval_secs: Some(5),
                    device_code: Some(Secret::new(DEVICE_CODE.to_string())),
                    ..Default::default()
                },
                FlowType::BrowserRedirect => FlowInitiation {
                    auth_url: Some("https://auth.example/authorize?cb=local".into()),
                    state: state.clone(),
                    ..Default::default()
                },
            };
            Ok(initiation)
        })
    }

    fn exchange<'a>(&'a self, code: &'a str) -> FlowFuture<'a, OAuthToken> {
        Box::pin(async move {
            self.script.shared.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.script.queues().exchange_codes.push(code.to_string());
            self.script.pause().await;
            let next = self.script.queues().exchange.pop_front();
            next.unwrap_or_else(|| Err(FlowError::Provider("no scripted exchange".into())))
        })
    }

    fn poll<'a>(&'a self, device_code: &'a str) -> FlowFuture<'a, PollOutcome> {
        Box::pin(async move {
            self.script.shared.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.script.queues().poll_codes.push(device_code.to_string());
            self.script.pause().await;
            let next = self.script.queues().poll.pop_front();
            next.unwrap_or(Ok(PollOutcome::Pending))
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> FlowFuture<'a, OAuthToken> {
        Box::pin(async move {
            self.script.shared.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.script.queues().refresh_tokens.push(refresh_token.to_string());
            self.script.pause().await;
            let next = self.script.queues().refresh.pop_front();
            next.unwrap_or_else(|| Err(FlowError::Transport("no scripted refresh".into())))
        })
    }
}

/// Registry with one provider backed by `script`.
pub fn registry(provider: &str, script: &Script) -> FlowRegistry {
    let script = script.clone();
    FlowRegistry::new().with(provider, move || script.flow())
}

/// Broker over file stores in a fresh temp dir. Keep the `TempDir` alive for
/// the duration of the test.
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub tokens: Arc<FileTokenStore>,
    pub keys: Arc<FileKeyStore>,
    pub dir: TempDir,
}

pub async fn test_broker(flows: FlowRegistry) -> TestBroker {
    test_broker_with(flows, BrokerSettings::default()).await
}

pub async fn test_broker_with(flows: FlowRegistry, settings: BrokerSettings) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let tokens = Arc::new(
        FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap(),
    );
    let keys = Arc::new(
        FileKeyStore::load(dir.path().join("api-keys.json"))
            .await
            .unwrap(),
    );
    let broker = Arc::new(Broker::new(
        tokens.clone() as Arc<dyn TokenStore>,
        keys.clone() as Arc<dyn KeyStore>,
        flows,
        settings,
    ));
    TestBroker {
        broker,
        tokens,
        keys,
        dir,
    }
}

/// Identity of a peer running as the test process.
pub fn local_peer() -> PeerIdentity {
    PeerIdentity {
        kind: PeerKind::Uid,
        uid: Some(effective_uid()),
        pid: Some(std::process::id() as i32),
    }
}
