//! Trigger configuration shapes, deserialized directly from the
//! `custom-triggers` section of the proxy's YAML config.

use serde::{Deserialize, Serialize};

/// What a GCode trigger does with the matched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerBehavior {
    /// Send the GCode to the device, then run the command.
    Forward,
    /// Run the command in place of the GCode; respond once it exits.
    Capture,
    /// Like `Capture`, but never synchronized to the device's idle point.
    CaptureNoWait,
}

fn default_behavior() -> TriggerBehavior {
    TriggerBehavior::Capture
}

/// Intercepts a GCode line matching `match`, optionally gated to one
/// device status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GCodeTriggerConfig {
    #[serde(rename = "match")]
    pub regex: String,
    #[serde(default)]
    pub synchronize: bool,
    #[serde(default = "default_behavior")]
    pub behavior: TriggerBehavior,
    /// Device status word (e.g. `"Idle"`) the trigger is restricted to,
    /// or `None` to match regardless of status.
    #[serde(default)]
    pub state: Option<String>,
}

/// Runs `command` after the device has remained in a status matching
/// `match` for `delay` seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTriggerConfig {
    #[serde(rename = "match")]
    pub regex: String,
    pub delay: f64,
}

/// A GCode trigger or a state trigger, distinguished by the YAML
/// `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    #[serde(rename = "gcode")]
    GCode(GCodeTriggerConfig),
    State(StateTriggerConfig),
}

/// One entry of `ProxyConfig::custom_triggers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTriggerConfig {
    pub id: String,
    #[serde(flatten)]
    pub trigger: TriggerConfig,
    pub command: String,
}
