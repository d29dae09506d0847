//! Application configuration
//!
//! Loaded from TOML (default `~/.config/ocpp-csms/config.toml`, overridable
//! via the `OCPP_CSMS_CONFIG` environment variable). Every field has a
//! default so a missing or partial file still yields a runnable config.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
    pub forwarder: ForwarderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the WebSocket server.
    pub host: String,
    pub port: u16,
    /// Heartbeat interval advertised in BootNotification responses, seconds.
    pub heartbeat_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            heartbeat_interval: 300,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulation tick period, milliseconds.
    pub tick_interval_ms: u64,
    /// Observer heartbeat broadcast period, milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Simulated vehicle battery capacity, kWh.
    pub battery_capacity_kwh: f64,
    /// Delay before a Finishing session settles back to Available, ms.
    pub settle_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            battery_capacity_kwh: crate::domain::BATTERY_CAPACITY_KWH,
            settle_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Command line spawned per station session; every inbound/outbound
    /// frame is mirrored to its stdin and its stdout lines re-enter the
    /// router. Absent means no forwarder.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
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

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Default config file location: `~/.config/ocpp-csms/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-csms")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.address(), "0.0.0.0:9000");
        assert_eq!(cfg.simulation.tick_interval_ms, 1_000);
        assert_eq!(cfg.simulation.battery_capacity_kwh, 42.0);
        assert!(cfg.forwarder.command.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9100

            [forwarder]
            command = "python3 meter_sim.py"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.forwarder.command.as_deref(), Some("python3 meter_sim.py"));
        assert_eq!(cfg.logging.level, "info");
    }
}
