//! Configuration for the GRBL GCode proxy: defaults, YAML file, CLI
//! overrides, and `GCODE_PROXY_*` environment variables, layered in
//! that order of increasing precedence.

pub mod config;
pub mod error;

pub use config::{default_config_path, CliOverrides, DeviceConfig, ProxyConfig, ServerConfig};
pub use error::ConfigError;
