//! Pure classification functions over a cleaned GRBL line or outgoing
//! command. No I/O, no state.

use grblproxy_core::DeviceStatus;
use std::sync::LazyLock;

static TERMINATOR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)^(ok|error:\d+|!!|Grbl\s+\d+\.\d+.*)$").unwrap());

static STATUS_WORD: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^<(\w+)[|,]").unwrap());

/// Does `line` terminate a command (an ack, or a startup banner)?
pub fn is_terminator(line: &str) -> bool {
    TERMINATOR.is_match(line.trim())
}

/// Is `cmd` the single-byte soft-reset command?
pub fn is_soft_reset(cmd: &str) -> bool {
    cmd == "\u{18}"
}

/// Is `cmd` a real-time command: processed immediately by the firmware
/// and never charged against the character buffer?
pub fn is_immediate(cmd: &str) -> bool {
    let trimmed = cmd.trim();
    matches!(trimmed, "?" | "!" | "~" | "M0" | "M1" | "M2" | "M30") || is_soft_reset(cmd)
}

/// Extract the leading status word from a `<Word|...>` / `<Word,...>`
/// report, returning the raw line alongside it.
pub fn parse_status(line: &str) -> Option<(DeviceStatus, &str)> {
    let caps = STATUS_WORD.captures(line)?;
    let word = caps.get(1)?.as_str();
    Some((DeviceStatus::from_word(word), line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ok_and_error_terminators() {
        assert!(is_terminator("ok"));
        assert!(is_terminator("OK"));
        assert!(is_terminator("error:9"));
        assert!(!is_terminator("ALARM:1"));
    }

    #[test]
    fn recognizes_version_banner_as_terminator() {
        assert!(is_terminator("Grbl 1.1h ['$' for help]"));
    }

    #[test]
    fn recognizes_soft_reset_byte() {
        assert!(is_soft_reset("\u{18}"));
        assert!(!is_soft_reset("?"));
    }

    #[test]
    fn recognizes_immediate_commands() {
        for cmd in ["?", "!", "~", "M0", "M1", "M2", "M30", "\u{18}"] {
            assert!(is_immediate(cmd), "{cmd} should be immediate");
        }
        assert!(!is_immediate("G0 X1\n"));
    }

    #[test]
    fn parses_pipe_delimited_status() {
        let (status, raw) = parse_status("<Run|MPos:1.0,0.0,0.0|FS:0,0>").unwrap();
        assert_eq!(status, DeviceStatus::Run);
        assert_eq!(raw, "<Run|MPos:1.0,0.0,0.0|FS:0,0>");
    }

    #[test]
    fn parses_comma_delimited_status() {
        let (status, _) = parse_status("<Idle,MPos:0.0,0.0,0.0>").unwrap();
        assert_eq!(status, DeviceStatus::Idle);
    }

    #[test]
    fn unknown_word_maps_to_unknown_status() {
        let (status, _) = parse_status("<Jog|MPos:0,0,0>").unwrap();
        assert_eq!(status, DeviceStatus::Unknown);
    }

    #[test]
    fn non_status_line_does_not_parse() {
        assert!(parse_status("ok").is_none());
    }
}
