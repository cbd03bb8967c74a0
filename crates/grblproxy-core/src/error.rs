//! Error handling for the GRBL proxy
//!
//! Layered per-subsystem error enums, each `thiserror`-derived, aggregated
//! into a single [`Error`] for public APIs that need to cross subsystem
//! boundaries (the service supervisor, the CLI).

use thiserror::Error;

/// Errors raised by the serial line codec and the device engine's
/// connection/discovery path.
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("serial port not found: {port}")]
    PortNotFound { port: String },

    #[error("serial port busy: {port}")]
    PortBusy { port: String },

    #[error("failed to open serial port {port}: {reason}")]
    FailedToOpen { port: String, reason: String },

    #[error("serial write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("serial read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("exactly one of usb-id or dev-path must be configured")]
    AmbiguousTarget,

    #[error("invalid usb id '{0}', expected format vvvv:pppp")]
    InvalidUsbId(String),

    #[error("device disconnected")]
    Disconnected,
}

/// Errors raised while admitting or executing a [`Task`](crate::Task).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("command queue is full (limit: {limit})")]
    QueueFull { limit: usize },

    #[error("device offline")]
    DeviceOffline,

    #[error("error:9")]
    AlarmGate,

    #[error("shell task failed: {0}")]
    ShellFailed(String),
}

/// Errors raised while compiling or evaluating trigger configuration.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("trigger '{id}' has invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        id: String,
        pattern: String,
        reason: String,
    },

    #[error("trigger '{id}' has unsupported type '{kind}'")]
    UnsupportedType { id: String, kind: String },

    #[error("duplicate trigger id '{0}'")]
    DuplicateId(String),
}

/// Unified error type for public, cross-subsystem APIs.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
