//! Relay configuration.
//!
//! Values come from an optional TOML file and `AGORA__*` environment
//! variables (`AGORA__RELAY__MAX_HUBS=50` sets `relay.max_hubs`). Missing
//! keys fall back to the defaults below.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "AGORA";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub relay: RelaySettings,
    pub timeouts: TimeoutSettings,
    pub persistent: PersistentSettings,
    pub gateway: GatewaySettings,
}

impl AppConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        built
            .try_deserialize()
            .context("parsing configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Hub limits and store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Maximum number of hubs in the store.
    pub max_hubs: u64,
    /// Maximum number of channels in a single hub.
    pub max_channels_per_hub: u64,
    /// Store backend: "memory" or "persistent".
    pub store_type: String,
    /// Author ID of the relay itself; its own events are never relayed.
    pub self_id: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_hubs: 1000,
            max_channels_per_hub: 10,
            store_type: "memory".to_string(),
            self_id: String::new(),
        }
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Bound on a single store call.
    pub store_ms: u64,
    /// Bound on a single send to one channel.
    pub send_ms: u64,
    /// Bound on handling one inbound event, fan-out included.
    pub event_deadline_ms: u64,
}

impl TimeoutSettings {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    pub fn event_deadline(&self) -> Duration {
        Duration::from_millis(self.event_deadline_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            store_ms: 5_000,
            send_ms: 10_000,
            event_deadline_ms: 30_000,
        }
    }
}

/// Connection parameters for the persistent store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentSettings {
    /// SQLite URL, e.g. `sqlite:///var/lib/agora/agora.db`. Defaults to
    /// `agora.db` in the data directory when unset.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl PersistentSettings {
    /// Database URL, falling back to `agora.db` under `data_dir`.
    pub fn resolve_url(&self, data_dir: &Path) -> String {
        match self.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.to_string(),
            _ => format!("sqlite://{}", data_dir.join("agora.db").display()),
        }
    }
}

impl Default for PersistentSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

/// Chat platform credentials, handed to the gateway adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub token: Option<String>,
}
