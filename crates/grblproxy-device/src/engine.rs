//! The GRBL device engine.
//!
//! Owns the serial connection, the buffer-quota character-counting
//! protocol, the pending/in-flight task queues, and the device-state
//! model. All of that state lives on a single task; everything else
//! talks to it through [`DeviceHandle`] and the [`ResponseSink`] /
//! [`TriggerSink`] traits, never by sharing a lock.
//!
//! The state machine itself ([`EngineState`]) is synchronous and pure:
//! every transition takes an input and returns the [`Effect`]s it
//! wants performed (a write to the wire, a response, a spawned shell
//! command, a scheduled timer). The async `run` loop around it is the
//! only thing that touches I/O, which keeps the hard part of this
//! module testable without a serial port.

use crate::codec::{self, SerialReader, SerialWriter};
use crate::parser;
use grblproxy_core::{
    ClientId, DeviceState, DeviceStatus, GCodeTask, HomingPhase, ShellTask, Task, TaskError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Where to find the GRBL device on this host. Exactly one variant is
/// ever constructed; validated at config load.
#[derive(Debug, Clone)]
pub enum DeviceTarget {
    UsbId(String),
    DevPath(String),
}

#[derive(Debug, Clone)]
pub struct DeviceEngineConfig {
    pub target: DeviceTarget,
    pub baud_rate: u32,
    pub serial_delay_ms: u64,
    pub grbl_buffer_size: usize,
    pub liveness_period_ms: u64,
    pub swallow_realtime_ok: bool,
    pub queue_limit: usize,
    pub poll_interval_ms: u64,
}

impl Default for DeviceEngineConfig {
    fn default() -> Self {
        Self {
            target: DeviceTarget::DevPath(String::new()),
            baud_rate: 115_200,
            serial_delay_ms: 2000,
            grbl_buffer_size: 128,
            liveness_period_ms: 1000,
            swallow_realtime_ok: false,
            queue_limit: 1000,
            poll_interval_ms: 1000,
        }
    }
}

/// Where engine responses go. Implemented by the connection manager;
/// the engine never depends on it directly.
pub trait ResponseSink: Send + Sync {
    fn unicast(&self, client: Option<ClientId>, line: &str);
    fn broadcast(&self, line: &str);
}

/// Notified on every observed device-status change. Implemented by the
/// trigger engine.
pub trait TriggerSink: Send + Sync {
    fn on_status_change(&self, status: DeviceStatus);
}

/// A side effect the pure state machine wants carried out. The async
/// run loop is the only thing that interprets these.
#[derive(Debug)]
enum Effect {
    Write(String),
    WriteByte(u8),
    Unicast(Option<ClientId>, String),
    Broadcast(String),
    RunShell(ShellTask, bool),
    ScheduleHomingGrace,
    NotifyTrigger(DeviceStatus),
}

/// Handle used by the connection/trigger layer to submit work and
/// check admission without touching engine internals.
#[derive(Clone)]
pub struct DeviceHandle {
    task_tx: mpsc::UnboundedSender<Task>,
    pending_len: Arc<AtomicUsize>,
    queue_limit: usize,
    shutdown: Arc<Notify>,
    status: Arc<std::sync::Mutex<DeviceStatus>>,
}

impl DeviceHandle {
    /// Is the pending queue already at its configured limit? Callers
    /// (the TCP server) check this before building a task at all.
    pub fn queue_full(&self) -> bool {
        self.pending_len.load(Ordering::Acquire) >= self.queue_limit
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Submit a task for the engine to admit. Only fails if the engine
    /// has already shut down.
    pub fn submit(&self, task: Task) -> Result<(), TaskError> {
        self.task_tx.send(task).map_err(|_| TaskError::DeviceOffline)
    }

    /// The device's last-observed status, used by the server to decide
    /// whether a state-restricted GCode trigger applies.
    pub fn current_status(&self) -> DeviceStatus {
        *self.status.lock().expect("device status lock poisoned")
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

/// The pure character-counting / queue state machine, with no
/// knowledge of the serial port or the network.
struct EngineState {
    device: DeviceState,
    pending: VecDeque<Task>,
    in_flight: VecDeque<Task>,
    buffer_quota: usize,
    grbl_buffer_size: usize,
    resume: bool,
    buffer_paused: bool,
    skippable_oks: usize,
    swallow_realtime_ok: bool,
    queue_limit: usize,
    connected: bool,
    last_command_client: Option<ClientId>,
}

impl EngineState {
    fn new(cfg: &DeviceEngineConfig) -> Self {
        Self {
            device: DeviceState::default(),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            buffer_quota: cfg.grbl_buffer_size,
            grbl_buffer_size: cfg.grbl_buffer_size,
            resume: true,
            buffer_paused: false,
            skippable_oks: 0,
            swallow_realtime_ok: cfg.swallow_realtime_ok,
            queue_limit: cfg.queue_limit,
            connected: false,
            last_command_client: None,
        }
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn on_connected(&mut self) -> Vec<Effect> {
        self.connected = true;
        self.reset_running_state()
    }

    fn on_disconnected(&mut self) -> Vec<Effect> {
        self.connected = false;
        self.device.set_disconnected();
        self.reset_running_state()
    }

    fn reset_running_state(&mut self) -> Vec<Effect> {
        self.in_flight.clear();
        self.pending.clear();
        self.buffer_quota = self.grbl_buffer_size;
        self.skippable_oks = 0;
        self.resume = true;
        self.buffer_paused = false;
        self.device.homing = HomingPhase::Off;
        vec![]
    }

    fn reject(&self, task: &Task, err: TaskError) -> Vec<Effect> {
        if !task.should_respond() {
            return vec![];
        }
        let line = match &err {
            TaskError::AlarmGate => err.to_string(),
            other => format!("error: {other}"),
        };
        vec![Effect::Unicast(task.client(), line)]
    }

    fn admit_task(&mut self, task: Task) -> Vec<Effect> {
        if !self.connected {
            return match task {
                Task::GCode(_) => self.reject(&task, TaskError::DeviceOffline),
                Task::Shell(s) => vec![Effect::RunShell(s, false)],
            };
        }

        if let Task::GCode(g) = &task {
            let cmd = g.trimmed();
            if parser::is_soft_reset(cmd) {
                let mut effects = self.reset_running_state();
                effects.push(Effect::WriteByte(0x18));
                return effects;
            }
            if cmd == "?" {
                let client = g.client;
                self.in_flight.push_front(Task::GCode(GCodeTask::new(client, "?".to_string(), g.should_respond)));
                return vec![Effect::WriteByte(b'?')];
            }
            if cmd == "!" {
                self.device.preempt(DeviceStatus::Hold);
                self.resume = false;
                return vec![Effect::WriteByte(b'!')];
            }
            if cmd == "~" {
                self.device.preempt(DeviceStatus::Run);
                self.resume = true;
                let mut effects = vec![Effect::WriteByte(b'~')];
                effects.extend(self.fill_buffer());
                return effects;
            }

            if self.device.status() == DeviceStatus::Alarm {
                let upper = cmd.to_ascii_uppercase();
                if upper != "$X" && upper != "$H" {
                    return self.reject(&task, TaskError::AlarmGate);
                }
            }
        }

        if matches!(&task, Task::GCode(_)) && self.pending.len() >= self.queue_limit {
            return self.reject(
                &task,
                TaskError::QueueFull {
                    limit: self.queue_limit,
                },
            );
        }

        self.pending.push_back(task);
        self.fill_buffer()
    }

    /// Step the buffer-fill loop. Called after every admission and
    /// every ack.
    fn fill_buffer(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            if self.buffer_paused || !self.resume {
                break;
            }
            let Some(front) = self.pending.front() else {
                break;
            };
            if let Task::GCode(g) = front {
                if !parser::is_immediate(g.trimmed()) && g.char_count > self.buffer_quota {
                    break;
                }
            }
            let task = self.pending.pop_front().expect("front already checked");
            match task {
                Task::GCode(g) => {
                    let immediate = parser::is_immediate(g.trimmed());
                    if !immediate {
                        self.buffer_quota -= g.char_count;
                    }
                    if g.trimmed().eq_ignore_ascii_case("$H") {
                        self.device.homing = HomingPhase::Queued;
                    }
                    self.last_command_client = g.client;
                    effects.push(Effect::Write(g.gcode.clone()));
                    if !immediate {
                        self.in_flight.push_back(Task::GCode(g));
                    }
                }
                Task::Shell(s) if s.wait_for_idle => {
                    self.buffer_paused = true;
                    let dwell = GCodeTask::new(None, "G4 P0".to_string(), false);
                    self.buffer_quota -= dwell.char_count;
                    effects.push(Effect::Write(dwell.gcode.clone()));
                    self.in_flight.push_back(Task::GCode(dwell));
                    self.in_flight.push_back(Task::Shell(s));
                }
                Task::Shell(s) => {
                    effects.push(Effect::RunShell(s, false));
                }
            }
        }
        effects.extend(self.drain_non_gcode_tasks());
        effects
    }

    /// Pop and execute any ShellTask(s) that have risen to the head of
    /// the in-flight queue (their preceding dwell has already acked).
    fn drain_non_gcode_tasks(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        while matches!(self.in_flight.front(), Some(Task::Shell(_))) {
            let Some(Task::Shell(s)) = self.in_flight.pop_front() else {
                unreachable!()
            };
            let wait_for_idle = s.wait_for_idle;
            effects.push(Effect::RunShell(s, wait_for_idle));
        }
        effects
    }

    /// A wait-for-idle shell task has finished running.
    fn on_shell_done(&mut self, client: Option<ClientId>, success: bool, output: String) -> Vec<Effect> {
        self.buffer_paused = false;
        let line = if success {
            format!("ok {output}").trim().to_string()
        } else {
            format!("error: {output}")
        };
        let mut effects = vec![Effect::Unicast(client, line)];
        effects.extend(self.fill_buffer());
        effects
    }

    fn handle_line(&mut self, line: &str) -> Vec<Effect> {
        let trimmed = line.trim();
        if trimmed.starts_with("ok") {
            if self.skippable_oks > 0 && self.swallow_realtime_ok {
                self.skippable_oks -= 1;
                return vec![];
            }
            return self.ack_oldest(true, None);
        }
        if let Some(code) = trimmed.strip_prefix("error:") {
            return self.ack_oldest(false, Some(format!("error:{code}")));
        }
        if trimmed.starts_with("ALARM:") {
            self.device.preempt(DeviceStatus::Alarm);
            let mut effects = vec![Effect::Broadcast(trimmed.to_string())];
            effects.extend(self.reset_running_state());
            return effects;
        }
        if trimmed.starts_with('<') {
            return self.handle_status(trimmed);
        }
        if trimmed.starts_with('[') {
            return vec![Effect::Broadcast(trimmed.to_string())];
        }
        if trimmed.starts_with('$') {
            return vec![Effect::Unicast(self.last_command_client, trimmed.to_string())];
        }
        if trimmed.contains("Grbl ") {
            let mut effects = vec![Effect::Broadcast(trimmed.to_string())];
            effects.extend(self.reset_running_state());
            self.device
                .update_from_report(DeviceStatus::Idle, trimmed.to_string());
            return effects;
        }
        vec![]
    }

    fn ack_oldest(&mut self, success: bool, error_line: Option<String>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(task) = self.in_flight.pop_front() {
            if let Task::GCode(g) = &task {
                self.buffer_quota += g.char_count;
            }
            if task.should_respond() {
                let line = if success {
                    "ok".to_string()
                } else {
                    error_line.unwrap_or_else(|| "error".to_string())
                };
                effects.push(Effect::Unicast(task.client(), line));
            }
        }
        effects.extend(self.fill_buffer());
        effects
    }

    fn handle_status(&mut self, line: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some((status, _)) = parser::parse_status(line) else {
            return effects;
        };
        let previous = self.device.status();
        let changed = self.device.update_from_report(status, line.to_string());

        if status == DeviceStatus::Alarm {
            effects.extend(self.reset_running_state());
        }

        if let Some(Task::GCode(g)) = self.in_flight.front() {
            if g.trimmed() == "?" {
                let client = g.client;
                effects.push(Effect::Unicast(client, line.to_string()));
                self.in_flight.pop_front();
            }
        }

        if previous == DeviceStatus::Home
            && status == DeviceStatus::Idle
            && self.device.homing == HomingPhase::Queued
        {
            self.device.homing = HomingPhase::Complete;
            effects.push(Effect::ScheduleHomingGrace);
        }

        if changed {
            effects.push(Effect::NotifyTrigger(status));
        }
        effects
    }

    fn on_homing_grace_expired(&mut self) -> Vec<Effect> {
        if self.device.homing != HomingPhase::Complete {
            return vec![];
        }
        let is_homing_task = matches!(
            self.in_flight.front(),
            Some(Task::GCode(g)) if g.trimmed().eq_ignore_ascii_case("$H")
        );
        if is_homing_task {
            self.device.homing = HomingPhase::Off;
            return self.ack_oldest(true, None);
        }
        vec![]
    }

    fn liveness_tick(&mut self, swallow: bool) -> Vec<Effect> {
        if swallow {
            self.skippable_oks += 1;
        }
        vec![Effect::WriteByte(b'?')]
    }
}

enum Internal {
    Task(Task),
    Lines(Vec<String>),
    Disconnected,
    HomingGraceExpired,
    ShellDone {
        client: Option<ClientId>,
        success: bool,
        output: String,
    },
    Liveness,
}

/// Spawn the real GRBL device engine, returning a handle to submit
/// work. Runs until [`DeviceHandle::stop`] is called.
pub fn spawn(
    cfg: DeviceEngineConfig,
    response_sink: Arc<dyn ResponseSink>,
    trigger_sink: Arc<dyn TriggerSink>,
) -> DeviceHandle {
    let (task_tx, task_rx) = mpsc::unbounded_channel();
    let pending_len = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(Notify::new());
    let status = Arc::new(std::sync::Mutex::new(DeviceStatus::default()));

    let handle = DeviceHandle {
        task_tx,
        pending_len: pending_len.clone(),
        queue_limit: cfg.queue_limit,
        shutdown: shutdown.clone(),
        status: status.clone(),
    };

    tokio::spawn(run(
        cfg,
        task_rx,
        pending_len,
        status,
        shutdown,
        response_sink,
        trigger_sink,
    ));

    handle
}

/// Spawn a dry-run stand-in that acknowledges every GCodeTask
/// immediately and executes ShellTasks without ever touching a serial
/// port.
pub fn spawn_dry_run(queue_limit: usize, response_sink: Arc<dyn ResponseSink>) -> DeviceHandle {
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();
    let pending_len = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(Notify::new());
    let status = Arc::new(std::sync::Mutex::new(DeviceStatus::Idle));
    let handle = DeviceHandle {
        task_tx,
        pending_len,
        queue_limit,
        shutdown: shutdown.clone(),
        status,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                task = task_rx.recv() => {
                    let Some(task) = task else { break };
                    tracing::debug!(?task, "dry-run engine acking task");
                    if task.should_respond() {
                        response_sink.unicast(task.client(), "ok");
                    }
                }
            }
        }
    });

    handle
}

async fn run(
    cfg: DeviceEngineConfig,
    mut task_rx: mpsc::UnboundedReceiver<Task>,
    pending_len: Arc<AtomicUsize>,
    status_cell: Arc<std::sync::Mutex<DeviceStatus>>,
    shutdown: Arc<Notify>,
    response_sink: Arc<dyn ResponseSink>,
    trigger_sink: Arc<dyn TriggerSink>,
) {
    let mut state = EngineState::new(&cfg);
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();

    'reconnect: loop {
        let port_path = match wait_for_port(&cfg, &shutdown).await {
            Some(path) => path,
            None => break 'reconnect,
        };

        let (mut writer, mut reader) = match codec::open_split(&port_path, cfg.baud_rate).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, port = %port_path, "failed to open serial port, retrying");
                tokio::time::sleep(Duration::from_millis(cfg.poll_interval_ms)).await;
                continue 'reconnect;
            }
        };
        tokio::time::sleep(Duration::from_millis(cfg.serial_delay_ms)).await;

        for effect in state.on_connected() {
            apply(effect, &mut writer, &response_sink, &trigger_sink, &internal_tx).await;
        }
        *status_cell.lock().expect("device status lock poisoned") = state.device.status();
        tracing::info!(port = %port_path, "device connected");

        let lines_tx = internal_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.read_chunk().await {
                    Ok(lines) if lines.is_empty() => continue,
                    Ok(lines) => {
                        if lines_tx.send(Internal::Lines(lines)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = lines_tx.send(Internal::Disconnected);
                        break;
                    }
                }
            }
        });

        let mut liveness = tokio::time::interval(Duration::from_millis(cfg.liveness_period_ms.max(1)));
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let liveness_enabled = cfg.liveness_period_ms > 0;

        loop {
            let event = tokio::select! {
                _ = shutdown.notified() => {
                    reader_task.abort();
                    break 'reconnect;
                }
                task = task_rx.recv() => {
                    match task {
                        Some(t) => Internal::Task(t),
                        None => { reader_task.abort(); break 'reconnect; }
                    }
                }
                Some(msg) = internal_rx.recv() => msg,
                _ = liveness.tick(), if liveness_enabled => Internal::Liveness,
            };

            let disconnected = matches!(event, Internal::Disconnected);

            let effects = match event {
                Internal::Task(t) => state.admit_task(t),
                Internal::Lines(lines) => {
                    let mut effects = Vec::new();
                    for line in lines {
                        effects.extend(state.handle_line(&line));
                    }
                    effects
                }
                Internal::Disconnected => state.on_disconnected(),
                Internal::HomingGraceExpired => state.on_homing_grace_expired(),
                Internal::ShellDone { client, success, output } => {
                    state.on_shell_done(client, success, output)
                }
                Internal::Liveness => state.liveness_tick(cfg.swallow_realtime_ok),
            };

            pending_len.store(state.pending_len(), Ordering::Release);
            *status_cell.lock().expect("device status lock poisoned") = state.device.status();

            for effect in effects {
                apply(effect, &mut writer, &response_sink, &trigger_sink, &internal_tx).await;
            }

            if disconnected {
                reader_task.abort();
                tracing::warn!("device disconnected, reconnecting");
                break;
            }
        }
    }
}

async fn apply(
    effect: Effect,
    writer: &mut SerialWriter,
    response_sink: &Arc<dyn ResponseSink>,
    trigger_sink: &Arc<dyn TriggerSink>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    match effect {
        Effect::Write(data) => {
            if let Err(e) = writer.write(&data).await {
                tracing::error!(error = %e, "serial write failed");
                let _ = internal_tx.send(Internal::Disconnected);
            }
        }
        Effect::WriteByte(byte) => {
            if let Err(e) = writer.write_byte(byte).await {
                tracing::error!(error = %e, "serial write failed");
                let _ = internal_tx.send(Internal::Disconnected);
            }
        }
        Effect::Unicast(client, line) => response_sink.unicast(client, &line),
        Effect::Broadcast(line) => response_sink.broadcast(&line),
        Effect::RunShell(task, wait_for_idle) => {
            let tx = internal_tx.clone();
            let sink = response_sink.clone();
            tokio::spawn(async move {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&task.command)
                    .output()
                    .await;
                let (success, text) = match output {
                    Ok(out) => (
                        out.status.success(),
                        String::from_utf8_lossy(if out.status.success() {
                            &out.stdout
                        } else {
                            &out.stderr
                        })
                        .trim()
                        .to_string(),
                    ),
                    Err(e) => (false, e.to_string()),
                };
                if wait_for_idle {
                    let _ = tx.send(Internal::ShellDone {
                        client: task.client,
                        success,
                        output: text,
                    });
                } else if task.should_respond {
                    let line = if success {
                        format!("ok {text}").trim().to_string()
                    } else {
                        format!("error: {text}")
                    };
                    sink.unicast(task.client, &line);
                }
            });
        }
        Effect::ScheduleHomingGrace => {
            let tx = internal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(Internal::HomingGraceExpired);
            });
        }
        Effect::NotifyTrigger(status) => trigger_sink.on_status_change(status),
    }
}

async fn wait_for_port(cfg: &DeviceEngineConfig, shutdown: &Notify) -> Option<String> {
    loop {
        let found = match &cfg.target {
            DeviceTarget::DevPath(path) => Some(path.clone()),
            DeviceTarget::UsbId(usb_id) => codec::find_port_by_usb_id(usb_id).ok(),
        };
        if let Some(path) = found {
            return Some(path);
        }
        tokio::select! {
            _ = shutdown.notified() => return None,
            _ = tokio::time::sleep(Duration::from_millis(cfg.poll_interval_ms)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_state(buffer_size: usize) -> EngineState {
        let cfg = DeviceEngineConfig {
            grbl_buffer_size: buffer_size,
            ..Default::default()
        };
        let mut state = EngineState::new(&cfg);
        state.on_connected();
        state
    }

    fn gcode(body: &str) -> Task {
        Task::GCode(GCodeTask::new(None, body.to_string(), true))
    }

    #[test]
    fn admits_and_sends_when_quota_available() {
        let mut state = connected_state(127);
        let effects = state.admit_task(gcode("G0 X1"));
        assert!(matches!(effects.as_slice(), [Effect::Write(line)] if line == "G0 X1\n"));
        assert_eq!(state.buffer_quota, 127 - "G0 X1\n".len());
        assert_eq!(state.in_flight.len(), 1);
    }

    #[test]
    fn blocks_admission_once_quota_exhausted() {
        let mut state = connected_state(10);
        let _ = state.admit_task(gcode("G0 X1")); // 6 bytes, quota now 4
        let effects = state.admit_task(gcode("G0 X22")); // 7 bytes, doesn't fit
        assert!(effects.is_empty());
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn ack_credits_quota_back_and_drains_pending() {
        let mut state = connected_state(10);
        let _ = state.admit_task(gcode("G0 X1")); // quota 10 -> 4
        let _ = state.admit_task(gcode("G0 X22")); // 7 bytes, queued pending
        let effects = state.ack_oldest(true, None);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unicast(_, line) if line == "ok")));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Write(line) if line == "G0 X22\n")));
        assert_eq!(state.in_flight.len(), 1);
    }

    #[test]
    fn error_ack_reports_the_error_code_to_the_task_client() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("G0 X1"));
        let effects = state.ack_oldest(false, Some("error:9".to_string()));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unicast(_, line) if line == "error:9")));
    }

    #[test]
    fn alarm_gate_rejects_non_homing_commands() {
        let mut state = connected_state(127);
        state.device.update_from_report(DeviceStatus::Alarm, "<Alarm|MPos:0,0,0>".to_string());
        let effects = state.admit_task(gcode("G0 X1"));
        assert!(matches!(effects.as_slice(), [Effect::Unicast(_, line)] if line == "error:9"));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn alarm_gate_admits_unlock_and_home() {
        let mut state = connected_state(127);
        state.device.update_from_report(DeviceStatus::Alarm, "<Alarm|MPos:0,0,0>".to_string());
        let effects = state.admit_task(gcode("$X"));
        assert!(matches!(effects.as_slice(), [Effect::Write(line)] if line == "$X\n"));
    }

    #[test]
    fn real_time_status_query_is_uncounted_and_preempts_in_flight() {
        let mut state = connected_state(127);
        let before = state.buffer_quota;
        let effects = state.admit_task(gcode("?"));
        assert!(matches!(effects.as_slice(), [Effect::WriteByte(b'?')]));
        assert_eq!(state.buffer_quota, before);
        assert_eq!(state.in_flight.len(), 1);
    }

    #[test]
    fn status_report_routes_to_the_client_that_sent_the_query() {
        let mut state = connected_state(127);
        let query = Task::GCode(GCodeTask::new(None, "?".to_string(), true));
        let _ = state.admit_task(query);
        let effects = state.handle_status("<Run|MPos:1.0,0.0,0.0|FS:0,0>");
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unicast(_, line) if line.starts_with("<Run"))));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn soft_reset_clears_queues_and_writes_the_control_byte() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("G0 X1"));
        let effects = state.admit_task(gcode("\u{18}"));
        assert!(effects.iter().any(|e| matches!(e, Effect::WriteByte(0x18))));
        assert!(state.in_flight.is_empty());
        assert_eq!(state.buffer_quota, state.grbl_buffer_size);
    }

    #[test]
    fn alarm_line_resets_running_state_and_broadcasts() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("G0 X1"));
        let effects = state.handle_line("ALARM:1");
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Broadcast(line) if line == "ALARM:1")));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn hold_pauses_fill_until_resume() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("!"));
        assert!(!state.resume);
        let effects = state.admit_task(gcode("G0 X1"));
        assert!(effects.is_empty());
        assert_eq!(state.pending.len(), 1);
        let effects = state.admit_task(gcode("~"));
        assert!(effects.iter().any(|e| matches!(e, Effect::Write(_))));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn homing_heuristic_synthesizes_ack_after_grace_period() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("$H"));
        assert_eq!(state.device.homing, HomingPhase::Queued);
        state
            .device
            .update_from_report(DeviceStatus::Home, "<Home|MPos:0,0,0>".to_string());
        let effects = state.handle_status("<Idle|MPos:0,0,0>");
        assert!(effects.iter().any(|e| matches!(e, Effect::ScheduleHomingGrace)));
        assert_eq!(state.device.homing, HomingPhase::Complete);
        let effects = state.on_homing_grace_expired();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unicast(_, line) if line == "ok")));
        assert_eq!(state.device.homing, HomingPhase::Off);
    }

    #[test]
    fn homing_grace_does_nothing_if_ok_already_arrived() {
        let mut state = connected_state(127);
        let _ = state.admit_task(gcode("$H"));
        state
            .device
            .update_from_report(DeviceStatus::Home, "<Home|MPos:0,0,0>".to_string());
        let _ = state.handle_status("<Idle|MPos:0,0,0>");
        let _ = state.ack_oldest(true, None);
        let effects = state.on_homing_grace_expired();
        assert!(effects.is_empty());
    }

    #[test]
    fn device_offline_rejects_gcode_but_runs_shell() {
        let cfg = DeviceEngineConfig::default();
        let mut state = EngineState::new(&cfg);
        let effects = state.admit_task(gcode("G0 X1"));
        assert!(matches!(effects.as_slice(), [Effect::Unicast(_, line)] if line.contains("device offline")));

        let shell = Task::Shell(ShellTask {
            client: None,
            id: "1".to_string(),
            command: "true".to_string(),
            should_respond: false,
            wait_for_idle: false,
        });
        let effects = state.admit_task(shell);
        assert!(matches!(effects.as_slice(), [Effect::RunShell(_, false)]));
    }

    #[test]
    fn pending_queue_rejects_once_full() {
        let cfg = DeviceEngineConfig {
            grbl_buffer_size: 1,
            queue_limit: 1,
            ..Default::default()
        };
        let mut state = EngineState::new(&cfg);
        state.on_connected();
        let _ = state.admit_task(gcode("G0 X1")); // too big to send immediately, fills the one queue slot
        let effects = state.admit_task(gcode("G0 X2"));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Unicast(_, line)] if line.contains("command queue is full")
        ));
    }

    #[test]
    fn wait_for_idle_shell_dwells_then_drains_after_dwell_acks() {
        let mut state = connected_state(127);
        let shell = Task::Shell(ShellTask {
            client: None,
            id: "1".to_string(),
            command: "echo hi".to_string(),
            should_respond: true,
            wait_for_idle: true,
        });
        let effects = state.admit_task(shell);
        assert!(matches!(effects.as_slice(), [Effect::Write(line)] if line == "G4 P0\n"));
        assert!(state.buffer_paused);
        assert_eq!(state.in_flight.len(), 2);

        let effects = state.ack_oldest(true, None); // dwell acks
        assert!(effects.iter().any(|e| matches!(e, Effect::RunShell(_, true))));
        assert_eq!(state.in_flight.len(), 0);

        let effects = state.on_shell_done(None, true, "hi".to_string());
        assert!(!state.buffer_paused);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unicast(_, line) if line.contains("ok"))));
    }
}
