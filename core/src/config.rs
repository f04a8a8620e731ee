//! Runtime configuration for the mesh transports
//!
//! A single [`Config`] is built at startup and handed to every component
//! that needs it. Nothing reads configuration from global state.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Largest frame body accepted on any stream (50 MiB)
pub const DEFAULT_FRAME_SIZE_MAX: usize = 50 * 1024 * 1024;

/// Default interval between heartbeat frames on stream links
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Default read timeout after which a silent link is torn down
pub const DEFAULT_TIMEOUT_INTERVAL_MS: u64 = 7_000;

/// Default fan-out cap for the Bluetooth switcher
pub const DEFAULT_CONNECTIONS_COUNT_MAX: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration shared by all transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum accepted frame body length in bytes
    pub frame_size_max: usize,
    /// Heartbeat interval for stream links that use keepalives
    pub heartbeat_interval_ms: u64,
    /// Read timeout for stream links that use keepalives
    pub timeout_interval_ms: u64,
    /// Bluetooth discovery and switcher settings
    pub bluetooth: BluetoothConfig,
    /// Wi-Fi (TCP + service discovery) settings
    pub wifi: WifiConfig,
}

/// Bluetooth discovery cycle durations and switcher limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub ble_scan_duration_ms: u64,
    pub ble_advertise_foreground_ms: u64,
    pub ble_advertise_background_ms: u64,
    pub ble_idle_background_ms: u64,
    /// How long a device that failed to connect is ignored
    pub ble_unsuitable_cooldown_ms: u64,
    /// Maximum number of direct neighbors before new dials are refused
    pub connections_count_max: usize,
}

/// Wi-Fi transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Address the TCP listener binds to; port 0 picks a free port
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_size_max: DEFAULT_FRAME_SIZE_MAX,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_interval_ms: DEFAULT_TIMEOUT_INTERVAL_MS,
            bluetooth: BluetoothConfig::default(),
            wifi: WifiConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            ble_scan_duration_ms: 5_000,
            ble_advertise_foreground_ms: 10_000,
            ble_advertise_background_ms: 30_000,
            ble_idle_background_ms: 120_000,
            ble_unsuitable_cooldown_ms: 30_000,
            connections_count_max: DEFAULT_CONNECTIONS_COUNT_MAX,
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_interval_ms)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size_max == 0 {
            return Err(ConfigError::Invalid {
                field: "frame_size_max",
                reason: "must be greater than zero".to_string(),
            });
        }
        // The wire length prefix is a u32
        if self.frame_size_max > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "frame_size_max",
                reason: format!("must not exceed {} bytes", u32::MAX),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.timeout_interval_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid {
                field: "timeout_interval_ms",
                reason: format!(
                    "must exceed heartbeat interval ({} ms)",
                    self.heartbeat_interval_ms
                ),
            });
        }
        self.bluetooth.validate()
    }
}

impl BluetoothConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections_count_max == 0 {
            return Err(ConfigError::Invalid {
                field: "bluetooth.connections_count_max",
                reason: "must be at least 1".to_string(),
            });
        }
        let durations = [
            ("bluetooth.ble_scan_duration_ms", self.ble_scan_duration_ms),
            ("bluetooth.ble_advertise_foreground_ms", self.ble_advertise_foreground_ms),
            ("bluetooth.ble_advertise_background_ms", self.ble_advertise_background_ms),
            ("bluetooth.ble_idle_background_ms", self.ble_idle_background_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn ble_scan_duration(&self) -> Duration {
        Duration::from_millis(self.ble_scan_duration_ms)
    }

    pub fn ble_advertise_duration(&self, foreground: bool) -> Duration {
        if foreground {
            Duration::from_millis(self.ble_advertise_foreground_ms)
        } else {
            Duration::from_millis(self.ble_advertise_background_ms)
        }
    }

    pub fn ble_idle_background(&self) -> Duration {
        Duration::from_millis(self.ble_idle_background_ms)
    }

    pub fn ble_unsuitable_cooldown(&self) -> Duration {
        Duration::from_millis(self.ble_unsuitable_cooldown_ms)
    }
}
