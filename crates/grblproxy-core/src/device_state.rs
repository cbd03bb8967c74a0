//! Device status and homing-phase state shared between the device engine
//! and the trigger engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The set of status words a GRBL status report can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Idle,
    Run,
    Hold,
    Door,
    Home,
    Alarm,
    Check,
    Disconnected,
    Unknown,
}

impl DeviceStatus {
    /// Parse the leading status word of a `<Word|...>` / `<Word,...>` report.
    /// Case-sensitive: GRBL emits these exactly capitalized.
    pub fn from_word(word: &str) -> Self {
        match word {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Door" => Self::Door,
            "Home" => Self::Home,
            "Alarm" => Self::Alarm,
            "Check" => Self::Check,
            _ => Self::Unknown,
        }
    }

    pub fn as_word(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Door => "Door",
            Self::Home => "Home",
            Self::Alarm => "Alarm",
            Self::Check => "Check",
            Self::Disconnected => "Disconnected",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_word())
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Tracks `$H` completion across the firmware's lost-`ok` failure mode.
///
/// `Queued` means an `$H` GCodeTask is in flight; `Complete` means the
/// Home -> Idle transition was observed and the grace-period ack timer
/// has been armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomingPhase {
    Off,
    Queued,
    Complete,
}

impl Default for HomingPhase {
    fn default() -> Self {
        Self::Off
    }
}

/// The device engine's view of the controller: last-seen status word, the
/// raw status line it was parsed from (kept so real-time commands can
/// splice a preemptive status without waiting on a fresh report), and the
/// homing heuristic phase.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    status: DeviceStatus,
    status_line: Option<String>,
    pub homing: HomingPhase,
}

impl DeviceState {
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// The last raw `<...>` line, if the device has ever reported one.
    pub fn status_line(&self) -> Option<&str> {
        if matches!(self.status, DeviceStatus::Unknown) {
            None
        } else {
            self.status_line.as_deref()
        }
    }

    /// Record a freshly parsed status report. Returns `true` if the status
    /// word changed (callers use this to decide whether to notify the
    /// trigger engine).
    pub fn update_from_report(&mut self, word: DeviceStatus, raw_line: String) -> bool {
        let changed = word != self.status;
        self.status = word;
        self.status_line = Some(raw_line);
        changed
    }

    /// Preemptively set the status without a fresh report (real-time
    /// commands `!`/`~`/soft-reset). Splices the cached status line's
    /// leading token so a subsequent unicast of the cached line (if any)
    /// is consistent, without fabricating position data.
    pub fn preempt(&mut self, word: DeviceStatus) -> bool {
        let changed = word != self.status;
        self.status = word;
        if let Some(line) = &self.status_line {
            self.status_line = Some(splice_leading_word(line, word.as_word()));
        }
        changed
    }

    pub fn reset_to_unknown(&mut self) {
        self.status = DeviceStatus::Unknown;
        self.status_line = None;
        self.homing = HomingPhase::Off;
    }

    pub fn set_disconnected(&mut self) {
        self.status = DeviceStatus::Disconnected;
        self.status_line = None;
        self.homing = HomingPhase::Off;
    }
}

/// Replace the leading `Word` in `<Word|...>` / `<Word,...>` with
/// `new_word`, leaving the rest of the line untouched. Returns the line
/// unmodified if it isn't bracketed.
fn splice_leading_word(line: &str, new_word: &str) -> String {
    let Some(inner) = line.strip_prefix('<') else {
        return line.to_string();
    };
    let delim_pos = inner.find(['|', ',']);
    let Some(pos) = delim_pos else {
        return line.to_string();
    };
    format!("<{}{}", new_word, &inner[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_preserves_rest_of_line() {
        let spliced = splice_leading_word("<Run|MPos:1.0,2.0,0.0|FS:0,0>", "Hold");
        assert_eq!(spliced, "<Hold|MPos:1.0,2.0,0.0|FS:0,0>");
    }

    #[test]
    fn splice_supports_comma_delimiter() {
        let spliced = splice_leading_word("<Idle,MPos:0.0,0.0,0.0>", "Run");
        assert_eq!(spliced, "<Run,MPos:0.0,0.0,0.0>");
    }

    #[test]
    fn preempt_updates_cached_line() {
        let mut state = DeviceState::default();
        state.update_from_report(DeviceStatus::Run, "<Run|MPos:1.0,0.0,0.0|FS:0,0>".to_string());
        state.preempt(DeviceStatus::Hold);
        assert_eq!(state.status(), DeviceStatus::Hold);
        assert_eq!(
            state.status_line(),
            Some("<Hold|MPos:1.0,0.0,0.0|FS:0,0>")
        );
    }

    #[test]
    fn status_line_hidden_while_unknown() {
        let state = DeviceState::default();
        assert_eq!(state.status_line(), None);
    }
}
