//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `BROKER_SOCKET` overrides `broker.socket_path` so service managers can
//! place the socket without editing the file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::validate::is_valid_name;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "credential-broker.toml";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Socket, limits and access policy
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_refresh_cooldown")]
    pub refresh_cooldown_secs: u64,
    #[serde(default)]
    pub peer_verification: PeerVerification,
    /// Reject exchange/poll/cancel from a different peer than the one that
    /// started the login.
    #[serde(default)]
    pub bind_sessions_to_peer: bool,
    /// When set, only these providers may be addressed.
    #[serde(default)]
    pub allowed_providers: Option<Vec<String>>,
    /// When set, only these buckets may be addressed.
    #[serde(default)]
    pub allowed_buckets: Option<Vec<String>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_requests_per_second: default_max_requests_per_second(),
            max_frame_bytes: default_max_frame_bytes(),
            session_timeout_secs: default_session_timeout(),
            refresh_cooldown_secs: default_refresh_cooldown(),
            peer_verification: PeerVerification::default(),
            bind_sessions_to_peer: false,
            allowed_providers: None,
            allowed_buckets: None,
        }
    }
}

/// Peer credential check requested by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerVerification {
    /// Strongest strategy the platform supports.
    #[default]
    Auto,
    Uid,
    PidLogOnly,
    Off,
}

/// Reference store file locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
            key_file: default_key_file(),
        }
    }
}

/// Prometheus exporter; disabled unless `listen_addr` is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::temp_dir().join(format!("credential-broker-{}", crate::peer::effective_uid()))
        });
    base.join("credential-broker").join("broker.sock")
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("credential-broker")
}

fn default_token_file() -> PathBuf {
    default_state_dir().join("tokens.json")
}

fn default_key_file() -> PathBuf {
    default_state_dir().join("api-keys.json")
}

fn default_max_requests_per_second() -> usize {
    60
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_session_timeout() -> u64 {
    600
}

fn default_refresh_cooldown() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse, overlay environment variables and validate.
    ///
    /// An empty document yields the defaults.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Some(socket) = std::env::var_os("BROKER_SOCKET") {
            config.broker.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let broker = &self.broker;

        if broker.socket_path.as_os_str().is_empty() {
            return Err(common::Error::Config("socket_path must not be empty".into()));
        }

        for (name, value) in [
            ("max_requests_per_second", broker.max_requests_per_second as u64),
            ("max_frame_bytes", broker.max_frame_bytes as u64),
            ("session_timeout_secs", broker.session_timeout_secs),
            ("refresh_cooldown_secs", broker.refresh_cooldown_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for (field, list) in [
            ("allowed_providers", &broker.allowed_providers),
            ("allowed_buckets", &broker.allowed_buckets),
        ] {
            if let Some(invalid) = list.iter().flatten().find(|n| !is_valid_name(n)) {
                return Err(common::Error::Config(format!(
                    "{field} contains an invalid name: {invalid:?}"
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// Returns the path and whether it was chosen explicitly (a missing
    /// explicit file is an error; a missing default file means defaults).
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[broker]
socket_path = "/run/user/1000/credential-broker/broker.sock"
max_requests_per_second = 30
session_timeout_secs = 300
peer_verification = "pid-log-only"
bind_sessions_to_peer = true
allowed_providers = ["gemini", "qwen"]

[storage]
token_file = "/var/lib/broker/tokens.json"
key_file = "/var/lib/broker/keys.json"

[metrics]
listen_addr = "127.0.0.1:9464"
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BROKER_SOCKET") };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.broker.socket_path,
            PathBuf::from("/run/user/1000/credential-broker/broker.sock")
        );
        assert_eq!(config.broker.max_requests_per_second, 30);
        assert_eq!(config.broker.session_timeout_secs, 300);
        assert_eq!(config.broker.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.broker.refresh_cooldown_secs, 30);
        assert_eq!(config.broker.peer_verification, PeerVerification::PidLogOnly);
        assert!(config.broker.bind_sessions_to_peer);
        assert_eq!(
            config.broker.allowed_providers.as_deref(),
            Some(&["gemini".to_string(), "qwen".to_string()][..])
        );
        assert!(config.broker.allowed_buckets.is_none());
        assert_eq!(
            config.storage.token_file,
            PathBuf::from("/var/lib/broker/tokens.json")
        );
        assert_eq!(
            config.metrics.listen_addr,
            Some("127.0.0.1:9464".parse().unwrap())
        );
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BROKER_SOCKET") };

        let config = Config::from_toml("").unwrap();
        assert_eq!(config.broker.max_requests_per_second, 60);
        assert_eq!(config.broker.session_timeout_secs, 600);
        assert_eq!(config.broker.peer_verification, PeerVerification::Auto);
        assert!(!config.broker.bind_sessions_to_peer);
        assert!(config.broker.socket_path.ends_with("credential-broker/broker.sock"));
        assert!(config.storage.token_file.ends_with("tokens.json"));
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io { .. })));
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = Config::from_toml("not valid {{{{ toml");
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_unknown_peer_verification_rejected() {
        let result = Config::from_toml("[broker]\npeer_verification = \"maybe\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_socket_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("BROKER_SOCKET", "/tmp/override.sock") };
        let config = Config::from_toml(valid_toml());
        unsafe { remove_env("BROKER_SOCKET") };

        assert_eq!(
            config.unwrap().broker.socket_path,
            PathBuf::from("/tmp/override.sock")
        );
    }

    #[test]
    fn test_zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BROKER_SOCKET") };

        for field in [
            "max_requests_per_second",
            "max_frame_bytes",
            "session_timeout_secs",
            "refresh_cooldown_secs",
        ] {
            let toml_content = format!("[broker]\n{field} = 0\n");
            let err = Config::from_toml(&toml_content).unwrap_err().to_string();
            assert!(
                err.contains(&format!("{field} must be greater than 0")),
                "{field}: got {err}"
            );
        }
    }

    #[test]
    fn test_empty_socket_path_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BROKER_SOCKET") };

        let err = Config::from_toml("[broker]\nsocket_path = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("socket_path must not be empty"));
    }

    #[test]
    fn test_invalid_allowlist_name_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BROKER_SOCKET") };

        let err = Config::from_toml("[broker]\nallowed_buckets = [\"ok\", \"../etc\"]\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("allowed_buckets"), "got: {err}");
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let (path, explicit) = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
        assert!(explicit);
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let (path, explicit) = Config::resolve_path(None);
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        assert!(explicit);
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let (path, explicit) = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(!explicit);
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let (path, _) = Config::resolve_path(Some("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
    }
}
