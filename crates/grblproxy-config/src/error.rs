//! Errors raised while loading, validating, or saving configuration.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly-requested `--config` path does not exist. A
    /// missing file at the *default* path is not an error.
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error reading config: {0}")]
    Io(#[from] io::Error),

    #[error("invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("exactly one of usb-id or dev-path must be configured")]
    AmbiguousDeviceTarget,

    #[error("invalid trigger configuration: {0}")]
    Trigger(#[from] grblproxy_core::TriggerError),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
