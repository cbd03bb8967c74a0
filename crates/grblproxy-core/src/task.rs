//! Task model: the unit of work handed from the connection/trigger layer
//! to the device engine.

use crate::ids::ClientId;

/// A single unit of work queued for the device engine.
#[derive(Debug, Clone)]
pub enum Task {
    GCode(GCodeTask),
    Shell(ShellTask),
}

impl Task {
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Task::GCode(t) => t.client,
            Task::Shell(t) => t.client,
        }
    }

    pub fn should_respond(&self) -> bool {
        match self {
            Task::GCode(t) => t.should_respond,
            Task::Shell(t) => t.should_respond,
        }
    }
}

/// A line of GCode bound for the serial port.
#[derive(Debug, Clone)]
pub struct GCodeTask {
    pub client: Option<ClientId>,
    pub gcode: String,
    pub char_count: usize,
    pub should_respond: bool,
}

impl GCodeTask {
    /// Normalize `gcode` (append a trailing newline if missing) and
    /// recompute `char_count` from the normalized body.
    pub fn new(client: Option<ClientId>, mut gcode: String, should_respond: bool) -> Self {
        if !gcode.ends_with('\n') {
            gcode.push('\n');
        }
        let char_count = gcode.len();
        Self {
            client,
            gcode,
            char_count,
            should_respond,
        }
    }

    pub fn trimmed(&self) -> &str {
        self.gcode.trim()
    }
}

/// A shell command executed on the host, optionally synchronized to the
/// device's idle point.
#[derive(Debug, Clone)]
pub struct ShellTask {
    pub client: Option<ClientId>,
    pub id: String,
    pub command: String,
    pub should_respond: bool,
    pub wait_for_idle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcode_task_appends_newline_and_counts_bytes() {
        let task = GCodeTask::new(None, "G0 X1".to_string(), true);
        assert_eq!(task.gcode, "G0 X1\n");
        assert_eq!(task.char_count, 6);
    }

    #[test]
    fn gcode_task_leaves_existing_newline_alone() {
        let task = GCodeTask::new(None, "G0 X1\n".to_string(), true);
        assert_eq!(task.gcode, "G0 X1\n");
        assert_eq!(task.char_count, 6);
    }

    #[test]
    fn trimmed_strips_surrounding_whitespace() {
        let task = GCodeTask::new(None, "  $H  \n".to_string(), true);
        assert_eq!(task.trimmed(), "$H");
    }
}
