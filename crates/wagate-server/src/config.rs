//! Server configuration.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use wagate_core::{BridgeConfig, CleanupPolicy, RegistryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
    #[serde(default = "default_restore_on_startup")]
    pub restore_on_startup: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./public")
}

fn default_credentials_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wagate")
        .join("sessions")
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:3100".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    3000
}

fn default_reconnect_max_delay() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_max_connections() -> usize {
    100
}

fn default_restore_on_startup() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
            credentials_dir: default_credentials_dir(),
            bridge_url: default_bridge_url(),
            connect_timeout_secs: default_connect_timeout(),
            ready_timeout_secs: default_ready_timeout(),
            request_timeout_secs: default_request_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_connections: default_max_connections(),
            cleanup_policy: CleanupPolicy::default(),
            restore_on_startup: default_restore_on_startup(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from default location (config/default.toml) or fall back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/default.toml");
        if config_path.exists() {
            return Self::load_from(&config_path);
        }

        Ok(Config::default())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_connections: self.max_connections,
            cleanup_policy: self.cleanup_policy,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            url: self.bridge_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}
