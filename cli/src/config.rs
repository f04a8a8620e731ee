// Configuration management for the meshlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshlink/config.json
// - Linux: ~/.config/meshlink/config.json
// - Windows: %APPDATA%\meshlink\config.json

use anyhow::{Context, Result};
use meshlink_core::Config as CoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// App id used when none is configured
pub const DEFAULT_APP_ID: u32 = 0x4D4C_0001;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespaces discovery; nodes only link with the same app id
    pub app_id: u32,

    /// Peers dialed on every `run`
    pub peers: Vec<SocketAddr>,

    /// Mesh core settings
    pub core: CoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID,
            peers: Vec::new(),
            core: CoreConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; the result is validated before it is accepted
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "app_id" => {
                updated.app_id = value.parse().context("Invalid app id")?;
            }
            "listen_addr" => {
                updated.core.wifi.listen_addr = value.parse().context("Invalid socket address")?;
            }
            "peers" => {
                updated.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| p.parse().with_context(|| format!("Invalid peer address: {}", p)))
                    .collect::<Result<_>>()?;
            }
            "frame_size_max" => {
                updated.core.frame_size_max = value.parse().context("Invalid number")?;
            }
            "heartbeat_interval_ms" => {
                updated.core.heartbeat_interval_ms = value.parse().context("Invalid number")?;
            }
            "timeout_interval_ms" => {
                updated.core.timeout_interval_ms = value.parse().context("Invalid number")?;
            }
            "connections_count_max" => {
                updated.core.bluetooth.connections_count_max =
                    value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.core.validate().context("Rejected config value")?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "app_id" => Some(self.app_id.to_string()),
            "listen_addr" => Some(self.core.wifi.listen_addr.to_string()),
            "peers" => Some(
                self.peers
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            "frame_size_max" => Some(self.core.frame_size_max.to_string()),
            "heartbeat_interval_ms" => Some(self.core.heartbeat_interval_ms.to_string()),
            "timeout_interval_ms" => Some(self.core.timeout_interval_ms.to_string()),
            "connections_count_max" => Some(self.core.bluetooth.connections_count_max.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "app_id",
            "listen_addr",
            "peers",
            "frame_size_max",
            "heartbeat_interval_ms",
            "timeout_interval_ms",
            "connections_count_max",
        ]
        .iter()
        .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
        .collect()
    }
}
