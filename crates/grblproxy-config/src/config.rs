//! Layered configuration: struct defaults, overlaid by an optional YAML
//! file, overlaid by CLI flags that were actually passed, overlaid by
//! `GCODE_PROXY_*` environment variables (highest precedence).

use crate::error::{ConfigError, Result};
use grblproxy_triggers::CustomTriggerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_port() -> u16 {
    8080
}
fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_queue_limit() -> usize {
    50
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_serial_delay() -> u64 {
    100
}
fn default_response_timeout() -> u64 {
    30_000
}
fn default_liveness_period() -> u64 {
    1000
}
fn default_swallow_realtime_ok() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_queue_limit", alias = "queue_limit")]
    pub queue_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            queue_limit: default_queue_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceConfig {
    #[serde(default, alias = "usb_id", skip_serializing_if = "Option::is_none")]
    pub usb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_baud_rate", alias = "baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_serial_delay", alias = "serial_delay")]
    pub serial_delay: u64,
    #[serde(default = "default_response_timeout", alias = "response_timeout")]
    pub response_timeout: u64,
    #[serde(default = "default_liveness_period", alias = "liveness_period")]
    pub liveness_period: u64,
    #[serde(
        default = "default_swallow_realtime_ok",
        alias = "swallow_realtime_ok"
    )]
    pub swallow_realtime_ok: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            usb_id: None,
            path: None,
            baud_rate: default_baud_rate(),
            serial_delay: default_serial_delay(),
            response_timeout: default_response_timeout(),
            liveness_period: default_liveness_period(),
            swallow_realtime_ok: default_swallow_realtime_ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default, alias = "gcode_log_file", skip_serializing_if = "Option::is_none")]
    pub gcode_log_file: Option<String>,
    #[serde(default, alias = "tcp_log_file", skip_serializing_if = "Option::is_none")]
    pub tcp_log_file: Option<String>,
    #[serde(
        default,
        alias = "custom_triggers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub custom_triggers: Vec<CustomTriggerConfig>,
}

/// Every config key the CLI can override, `None` where the flag was not
/// passed on this invocation. CLI precedence only applies to flags the
/// user actually set; clap's own defaults must not leak in here.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub address: Option<String>,
    pub queue_limit: Option<usize>,
    pub usb_id: Option<String>,
    pub dev_path: Option<String>,
    pub baud_rate: Option<u32>,
    pub serial_delay: Option<u64>,
    pub response_timeout: Option<u64>,
    pub liveness_period: Option<u64>,
    pub swallow_realtime_ok: Option<bool>,
    pub gcode_log_file: Option<String>,
    pub tcp_log_file: Option<String>,
}

/// `$HOME/.config/gcode-proxy/config.yaml`, matching the source tool's
/// default so an existing deployment's config file keeps working.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gcode-proxy")
        .join("config.yaml")
}

impl ProxyConfig {
    /// Layer defaults -> YAML file -> CLI -> environment, then validate
    /// unless `skip_device_validation` (dry-run).
    pub fn load(
        config_file: Option<&Path>,
        cli: CliOverrides,
        skip_device_validation: bool,
    ) -> Result<ProxyConfig> {
        let mut config = Self::from_file(config_file)?;
        config.apply_cli(&cli);
        config.apply_env();
        if !skip_device_validation {
            config.validate_device_target()?;
        }
        Ok(config)
    }

    fn from_file(explicit_path: Option<&Path>) -> Result<ProxyConfig> {
        let (path, required) = match explicit_path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                Ok(ProxyConfig::default())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::FileNotFound(path.display().to_string()))
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(v) = cli.port {
            self.server.port = v;
        }
        if let Some(v) = &cli.address {
            self.server.address = v.clone();
        }
        if let Some(v) = cli.queue_limit {
            self.server.queue_limit = v;
        }
        if let Some(v) = &cli.usb_id {
            self.device.usb_id = Some(v.clone());
        }
        if let Some(v) = &cli.dev_path {
            self.device.path = Some(v.clone());
        }
        if let Some(v) = cli.baud_rate {
            self.device.baud_rate = v;
        }
        if let Some(v) = cli.serial_delay {
            self.device.serial_delay = v;
        }
        if let Some(v) = cli.response_timeout {
            self.device.response_timeout = v;
        }
        if let Some(v) = cli.liveness_period {
            self.device.liveness_period = v;
        }
        if let Some(v) = cli.swallow_realtime_ok {
            self.device.swallow_realtime_ok = v;
        }
        if let Some(v) = &cli.gcode_log_file {
            self.gcode_log_file = Some(v.clone());
        }
        if let Some(v) = &cli.tcp_log_file {
            self.tcp_log_file = Some(v.clone());
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parsed("GCODE_PROXY_SERVER_PORT") {
            self.server.port = v;
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_SERVER_ADDRESS") {
            self.server.address = v;
        }
        if let Some(v) = env_parsed("GCODE_PROXY_SERVER_QUEUE_LIMIT") {
            self.server.queue_limit = v;
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_DEVICE_USB_ID") {
            self.device.usb_id = Some(v);
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_DEVICE_DEV_PATH") {
            self.device.path = Some(v);
        }
        if let Some(v) = env_parsed("GCODE_PROXY_DEVICE_BAUD_RATE") {
            self.device.baud_rate = v;
        }
        if let Some(v) = env_parsed("GCODE_PROXY_DEVICE_SERIAL_DELAY") {
            self.device.serial_delay = v;
        }
        if let Some(v) = env_parsed("GCODE_PROXY_DEVICE_RESPONSE_TIMEOUT") {
            self.device.response_timeout = v;
        }
        if let Some(v) = env_parsed("GCODE_PROXY_DEVICE_LIVENESS_PERIOD") {
            self.device.liveness_period = v;
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_DEVICE_SWALLOW_REALTIME_OK") {
            self.device.swallow_realtime_ok =
                matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_GCODE_LOG_FILE") {
            self.gcode_log_file = Some(v);
        }
        if let Ok(v) = std::env::var("GCODE_PROXY_TCP_LOG_FILE") {
            self.tcp_log_file = Some(v);
        }
    }

    fn validate_device_target(&self) -> Result<()> {
        let usb_set = self
            .device
            .usb_id
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        let path_set = self
            .device
            .path
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if usb_set == path_set {
            return Err(ConfigError::AmbiguousDeviceTarget);
        }
        Ok(())
    }

    /// Write this configuration to `path` (or the default path), YAML,
    /// hyphenated keys, creating parent directories as needed.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.queue_limit, 50);
        assert_eq!(config.device.baud_rate, 115_200);
        assert!(config.device.swallow_realtime_ok);
    }

    #[test]
    fn validate_requires_exactly_one_device_target() {
        let mut config = ProxyConfig::default();
        assert!(config.validate_device_target().is_err());
        config.device.usb_id = Some("1a86:7523".to_string());
        assert!(config.validate_device_target().is_ok());
        config.device.path = Some("/dev/ttyUSB0".to_string());
        assert!(config.validate_device_target().is_err());
    }

    #[test]
    fn yaml_accepts_hyphenated_and_underscored_keys() {
        let hyphenated = "server:\n  queue-limit: 7\ndevice:\n  usb-id: \"1a86:7523\"\n";
        let config: ProxyConfig = serde_yaml::from_str(hyphenated).unwrap();
        assert_eq!(config.server.queue_limit, 7);
        assert_eq!(config.device.usb_id.as_deref(), Some("1a86:7523"));

        let underscored = "server:\n  queue_limit: 9\ndevice:\n  usb_id: \"1a86:7523\"\n";
        let config: ProxyConfig = serde_yaml::from_str(underscored).unwrap();
        assert_eq!(config.server.queue_limit, 9);
        assert_eq!(config.device.usb_id.as_deref(), Some("1a86:7523"));
    }

    #[test]
    fn cli_overrides_file_defaults() {
        let mut config = ProxyConfig::default();
        let cli = CliOverrides {
            port: Some(9000),
            ..Default::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.address, "0.0.0.0");
    }

    #[test]
    fn save_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = ProxyConfig::default();
        config.device.usb_id = Some("1a86:7523".to_string());
        config.save(Some(&path)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("usb-id"));
        assert!(text.contains("queue-limit"));

        let reloaded: ProxyConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(reloaded.device.usb_id.as_deref(), Some("1a86:7523"));
    }

    #[test]
    fn missing_default_config_file_is_not_an_error() {
        let config = ProxyConfig::from_file(None);
        assert!(config.is_ok());
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let path = Path::new("/nonexistent/path/gcode-proxy-config-test.yaml");
        let result = ProxyConfig::from_file(Some(path));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
