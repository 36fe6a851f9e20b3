use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// One Janus instance the gateway manages.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Server-assigned identity; must be unique across the pool.
    pub server_name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub admin_port: u16,
    #[serde(default)]
    pub admin_key: String,
    #[serde(default = "default_admin_secret")]
    pub admin_secret: String,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-transaction deadline; 0 disables it.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
}

impl BackendConfig {
    pub fn new(
        server_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        admin_port: u16,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            protocol: default_protocol(),
            address: address.into(),
            port,
            admin_port,
            admin_key: String::new(),
            admin_secret: default_admin_secret(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }

    pub fn admin_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.admin_port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        (self.transaction_timeout_ms > 0).then(|| Duration::from_millis(self.transaction_timeout_ms))
    }
}

/// Gateway configuration, loaded from a TOML file with env overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where the reconciled room table is persisted.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Release a user's handles when their connection times out or is
    /// superseded.
    #[serde(default = "default_detach_on_drop")]
    pub detach_on_drop: bool,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment variables override the file for scalar settings.
    pub fn apply_env(&mut self) {
        if let Some(port) = env::var("FLEET_PORT").ok().and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Ok(path) = env::var("FLEET_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(ms) = env::var("FLEET_KEEPALIVE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.keep_alive_timeout_ms = ms;
        }
        if let Some(ms) = env::var("FLEET_SYNC_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.sync_interval_ms = ms;
        }
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            state_path: default_state_path(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            detach_on_drop: default_detach_on_drop(),
            backends: Vec::new(),
        }
    }
}

fn default_protocol() -> String {
    "ws".to_string()
}

fn default_admin_secret() -> String {
    "janusoverlord".to_string()
}

fn default_keepalive_interval_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_transaction_timeout_ms() -> u64 {
    10_000
}

fn default_port() -> u16 {
    8080
}

fn default_state_path() -> PathBuf {
    PathBuf::from("fleet-rooms.json")
}

fn default_keep_alive_timeout_ms() -> u64 {
    30_000
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

fn default_detach_on_drop() -> bool {
    true
}
