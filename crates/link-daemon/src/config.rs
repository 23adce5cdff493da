//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use link_core::{Features, HeartbeatConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Main configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the core listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Transport used for connections
    #[serde(default)]
    pub transport: TransportSetting,

    /// Enable the compact binary wire form
    #[serde(default)]
    pub raw: bool,

    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// What the core reports about itself
    #[serde(default)]
    pub core: CoreSettings,

    /// Accounts allowed to log in. An empty list means the core still needs setup.
    #[serde(default)]
    pub users: Vec<UserAccount>,

    /// Defaults for the `connect` command
    #[serde(default)]
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSetting {
    #[default]
    Websocket,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Seconds between heartbeats (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Unanswered heartbeats before the connection is dropped (default: 5)
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            max_missed: default_max_missed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_build_date")]
    pub build_date: String,

    /// Storage backends offered during setup, sent verbatim
    #[serde(default = "default_backends")]
    pub backends: Vec<Value>,

    #[serde(default)]
    pub network_ids: Vec<i32>,

    #[serde(default)]
    pub buffers: Vec<BufferSettings>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            build_date: default_build_date(),
            backends: default_backends(),
            network_ids: Vec::new(),
            buffers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    pub id: i32,
    pub network: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Core to connect to
    #[serde(default = "default_listen")]
    pub address: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Backend to request if the core turns out to be unconfigured
    pub setup_backend: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: default_listen(),
            user: String::new(),
            password: String::new(),
            setup_backend: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:4242".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_missed() -> u32 {
    5
}

fn default_version() -> String {
    concat!("link-daemon ", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_build_date() -> String {
    "unknown".to_string()
}

fn default_backends() -> Vec<Value> {
    vec![serde_json::json!({
        "DisplayName": "Memory",
        "Description": "Keeps everything in memory until the core stops",
    })]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            transport: TransportSetting::default(),
            raw: false,
            heartbeat: HeartbeatSettings::default(),
            core: CoreSettings::default(),
            users: Vec::new(),
            client: ClientSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from `config_file`, writing defaults there if it is missing
    pub fn load(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            if let Some(parent) = config_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Protocol features requested for every connection
    pub fn features(&self) -> Features {
        if self.raw {
            Features::RAW
        } else {
            Features::NONE
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat.interval_secs.max(1)),
            max_missed: self.heartbeat.max_missed,
        }
    }
}
