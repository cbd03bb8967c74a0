//! GCode-interception and device-state trigger tables.
//!
//! Compiled once from configuration and shared, read-only, between the
//! TCP server (which consults GCode triggers when building tasks) and
//! the device engine (which notifies state triggers on every status
//! change via [`grblproxy_device::TriggerSink`]).

pub mod config;
pub mod table;

pub use config::{CustomTriggerConfig, GCodeTriggerConfig, StateTriggerConfig, TriggerBehavior, TriggerConfig};
pub use table::TriggerTable;
