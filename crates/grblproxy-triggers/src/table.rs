//! Compiled trigger tables: GCode interception and device-state
//! watchers, built once at startup and shared read-only across the
//! server and the device engine.

use crate::config::{CustomTriggerConfig, TriggerBehavior, TriggerConfig};
use grblproxy_core::{ClientId, DeviceStatus, GCodeTask, ShellTask, Task, TriggerError};
use grblproxy_device::TriggerSink;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

struct CompiledGCodeTrigger {
    id: String,
    regex: regex::Regex,
    synchronize: bool,
    behavior: TriggerBehavior,
    state: Option<DeviceStatus>,
    command: String,
}

struct CompiledStateTrigger {
    id: String,
    regex: regex::Regex,
    delay: Duration,
    command: String,
}

/// The compiled GCode-trigger table plus a live registry of pending
/// state-trigger timers. Safe to share behind an `Arc`: the compiled
/// tables never change after construction, and timer bookkeeping is
/// the only mutable state.
pub struct TriggerTable {
    gcode: Vec<CompiledGCodeTrigger>,
    state: Vec<CompiledStateTrigger>,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TriggerTable {
    /// Compile `configs` into a trigger table. Rejects duplicate ids
    /// and unparseable regexes.
    pub fn compile(configs: &[CustomTriggerConfig]) -> Result<Self, TriggerError> {
        let mut seen = std::collections::HashSet::new();
        let mut gcode = Vec::new();
        let mut state = Vec::new();

        for cfg in configs {
            if !seen.insert(cfg.id.clone()) {
                return Err(TriggerError::DuplicateId(cfg.id.clone()));
            }
            match &cfg.trigger {
                TriggerConfig::GCode(g) => {
                    let regex = regex::Regex::new(&g.regex).map_err(|e| TriggerError::InvalidRegex {
                        id: cfg.id.clone(),
                        pattern: g.regex.clone(),
                        reason: e.to_string(),
                    })?;
                    gcode.push(CompiledGCodeTrigger {
                        id: cfg.id.clone(),
                        regex,
                        synchronize: g.synchronize,
                        behavior: g.behavior,
                        state: g.state.as_deref().map(DeviceStatus::from_word),
                        command: cfg.command.clone(),
                    });
                }
                TriggerConfig::State(s) => {
                    let regex = regex::Regex::new(&s.regex).map_err(|e| TriggerError::InvalidRegex {
                        id: cfg.id.clone(),
                        pattern: s.regex.clone(),
                        reason: e.to_string(),
                    })?;
                    state.push(CompiledStateTrigger {
                        id: cfg.id.clone(),
                        regex,
                        delay: Duration::from_secs_f64(s.delay),
                        command: cfg.command.clone(),
                    });
                }
            }
        }

        Ok(Self {
            gcode,
            state,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Build the tasks a server should submit for an incoming GCode
    /// line, applying every matching GCode trigger in config order. If
    /// none match, the line is forwarded unmodified.
    pub fn build_tasks_for_gcode(
        &self,
        gcode: &str,
        status: DeviceStatus,
        client: Option<ClientId>,
    ) -> Vec<Task> {
        let trimmed = gcode.trim();
        let matched: Vec<&CompiledGCodeTrigger> = self
            .gcode
            .iter()
            .filter(|t| t.regex.is_match(trimmed) && t.state.is_none_or(|s| s == status))
            .collect();

        if matched.is_empty() {
            return vec![Task::GCode(GCodeTask::new(client, gcode.to_string(), true))];
        }

        let mut tasks = Vec::with_capacity(matched.len() * 2);
        for trig in matched {
            match trig.behavior {
                TriggerBehavior::Forward => {
                    tasks.push(Task::GCode(GCodeTask::new(client, gcode.to_string(), true)));
                    tasks.push(Task::Shell(ShellTask {
                        client,
                        id: trig.id.clone(),
                        command: trig.command.clone(),
                        should_respond: false,
                        wait_for_idle: trig.synchronize,
                    }));
                }
                TriggerBehavior::Capture => {
                    tasks.push(Task::Shell(ShellTask {
                        client,
                        id: trig.id.clone(),
                        command: trig.command.clone(),
                        should_respond: true,
                        wait_for_idle: trig.synchronize,
                    }));
                }
                TriggerBehavior::CaptureNoWait => {
                    tasks.push(Task::Shell(ShellTask {
                        client,
                        id: trig.id.clone(),
                        command: trig.command.clone(),
                        should_respond: true,
                        wait_for_idle: false,
                    }));
                }
            }
        }
        tasks
    }
}

impl TriggerSink for TriggerTable {
    /// On every observed status transition, (re)schedule or cancel the
    /// delayed command for each state trigger whose regex now matches
    /// (or no longer matches) `status`.
    fn on_status_change(&self, status: DeviceStatus) {
        let word = status.as_word();
        let mut pending = self.pending.lock().expect("trigger timer lock poisoned");
        for trig in &self.state {
            let matches = trig.regex.is_match(word);
            let existing = pending.remove(&trig.id);
            if let Some(handle) = existing {
                handle.abort();
            }
            if matches {
                pending.insert(trig.id.clone(), spawn_delayed(&trig.id, trig.delay, &trig.command));
            }
        }
    }
}

fn spawn_delayed(id: &str, delay: Duration, command: &str) -> JoinHandle<()> {
    let id = id.to_string();
    let command = command.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tracing::info!(trigger = %id, "running state trigger command");
        match tokio::process::Command::new("sh").arg("-c").arg(&command).output().await {
            Ok(out) if !out.status.success() => {
                tracing::warn!(trigger = %id, status = ?out.status.code(), "state trigger command exited non-zero");
            }
            Err(e) => tracing::error!(trigger = %id, error = %e, "failed to run state trigger command"),
            _ => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcode_trigger(id: &str, regex: &str, behavior: TriggerBehavior, synchronize: bool) -> CustomTriggerConfig {
        CustomTriggerConfig {
            id: id.to_string(),
            trigger: TriggerConfig::GCode(crate::config::GCodeTriggerConfig {
                regex: regex.to_string(),
                synchronize,
                behavior,
                state: None,
            }),
            command: "echo matched".to_string(),
        }
    }

    #[test]
    fn unmatched_gcode_forwards_unmodified() {
        let table = TriggerTable::compile(&[]).unwrap();
        let tasks = table.build_tasks_for_gcode("G0 X1", DeviceStatus::Idle, None);
        assert_eq!(tasks.len(), 1);
        assert!(matches!(&tasks[0], Task::GCode(g) if g.trimmed() == "G0 X1"));
    }

    #[test]
    fn forward_behavior_emits_gcode_then_shell() {
        let cfg = gcode_trigger("t1", r"^M6\b", TriggerBehavior::Forward, true);
        let table = TriggerTable::compile(&[cfg]).unwrap();
        let tasks = table.build_tasks_for_gcode("M6 T1", DeviceStatus::Idle, None);
        assert_eq!(tasks.len(), 2);
        assert!(matches!(&tasks[0], Task::GCode(_)));
        assert!(matches!(&tasks[1], Task::Shell(s) if s.wait_for_idle && !s.should_respond));
    }

    #[test]
    fn capture_behavior_emits_only_shell() {
        let cfg = gcode_trigger("t1", r"^%tool-change%$", TriggerBehavior::Capture, true);
        let table = TriggerTable::compile(&[cfg]).unwrap();
        let tasks = table.build_tasks_for_gcode("%tool-change%", DeviceStatus::Idle, None);
        assert_eq!(tasks.len(), 1);
        assert!(matches!(&tasks[0], Task::Shell(s) if s.wait_for_idle && s.should_respond));
    }

    #[test]
    fn capture_no_wait_never_synchronizes() {
        let cfg = gcode_trigger("t1", r"^%beep%$", TriggerBehavior::CaptureNoWait, true);
        let table = TriggerTable::compile(&[cfg]).unwrap();
        let tasks = table.build_tasks_for_gcode("%beep%", DeviceStatus::Idle, None);
        assert!(matches!(&tasks[0], Task::Shell(s) if !s.wait_for_idle));
    }

    #[test]
    fn state_restricted_trigger_only_matches_in_that_state() {
        let mut cfg = gcode_trigger("t1", r"^\$H$", TriggerBehavior::Forward, false);
        if let TriggerConfig::GCode(g) = &mut cfg.trigger {
            g.state = Some("Alarm".to_string());
        }
        let table = TriggerTable::compile(&[cfg]).unwrap();
        let idle_tasks = table.build_tasks_for_gcode("$H", DeviceStatus::Idle, None);
        assert_eq!(idle_tasks.len(), 1); // unmatched: forwarded plain

        let alarm_tasks = table.build_tasks_for_gcode("$H", DeviceStatus::Alarm, None);
        assert_eq!(alarm_tasks.len(), 2); // matched: gcode + shell
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let a = gcode_trigger("dup", "^a$", TriggerBehavior::Forward, false);
        let b = gcode_trigger("dup", "^b$", TriggerBehavior::Forward, false);
        assert!(matches!(
            TriggerTable::compile(&[a, b]),
            Err(TriggerError::DuplicateId(id)) if id == "dup"
        ));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let bad = gcode_trigger("t1", "(unclosed", TriggerBehavior::Forward, false);
        assert!(matches!(
            TriggerTable::compile(&[bad]),
            Err(TriggerError::InvalidRegex { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn state_trigger_fires_after_delay_and_is_cancelled_on_exit() {
        let cfg = CustomTriggerConfig {
            id: "idle-timeout".to_string(),
            trigger: TriggerConfig::State(crate::config::StateTriggerConfig {
                regex: "^Idle$".to_string(),
                delay: 300.0,
            }),
            command: "true".to_string(),
        };
        let table = TriggerTable::compile(&[cfg]).unwrap();

        table.on_status_change(DeviceStatus::Idle);
        assert!(table.pending.lock().unwrap().contains_key("idle-timeout"));

        table.on_status_change(DeviceStatus::Run);
        assert!(!table.pending.lock().unwrap().contains_key("idle-timeout"));
    }
}
