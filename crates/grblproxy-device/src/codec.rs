//! Serial line codec: ASCII framing, ESP-log stripping, and port discovery.
//!
//! The codec owns nothing about GRBL semantics. It turns a byte stream
//! into cleaned, non-empty lines and turns outgoing strings into ASCII
//! bytes. GRBL-specific classification lives in [`crate::parser`].

use grblproxy_core::SerialError;
use std::sync::LazyLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

/// Matches a token worth keeping when an ESP-log-mangled line is cleaned:
/// a GRBL terminator, a status/info/setting line, a version banner, or a
/// bare decimal number. The regex is greedy from the left so the *last*
/// match in the line wins, which is what discards a logging prefix like
/// `I (123) tag: `.
static KEEP_TOKEN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)^.*?(\d+\.\d+|\$.*|ok|error:\d+|ALARM:\d+|<[^>]+>|\[MSG:[^\]]+\]|Grbl\s\d+\.\d+.*)$",
    )
    .expect("static regex is valid")
});

/// Reduce a raw serial line to its trailing GRBL token, discarding any
/// ESP logging preamble. Returns an empty string if the line carries no
/// recognizable token.
pub fn clean_grbl_line(raw: &str) -> String {
    match KEEP_TOKEN.captures(raw.trim_end()) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Default capacity of the bounded response-line queue before the oldest
/// line is dropped with a warning.
pub const DEFAULT_RESPONSE_QUEUE_SIZE: usize = 1000;

/// Accumulates bytes read from the serial port into cleaned lines.
///
/// Reading is character-by-character conceptually (the spec speaks of an
/// input buffer built up byte by byte); in practice we read whatever
/// chunk the port hands back and split on `\n` ourselves, which is
/// equivalent and avoids a syscall per byte.
pub struct LineAccumulator {
    buf: String,
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self { buf: String::new() }
    }
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes, returning zero or more cleaned, non-empty
    /// lines completed by this chunk (in order). Non-ASCII bytes are
    /// dropped with a warning rather than aborting the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &byte in chunk {
            if !byte.is_ascii() {
                tracing::warn!(byte, "dropping non-ASCII byte from serial stream");
                continue;
            }
            let ch = byte as char;
            if ch == '\n' {
                let line = std::mem::take(&mut self.buf);
                let trimmed = line.trim();
                let cleaned = clean_grbl_line(trimmed);
                if !cleaned.is_empty() {
                    out.push(cleaned);
                }
            } else {
                self.buf.push(ch);
            }
        }
        out
    }
}

/// Write half of an open serial connection.
pub struct SerialWriter {
    half: tokio::io::WriteHalf<tokio_serial::SerialStream>,
}

impl SerialWriter {
    /// Write a command as ASCII. Any non-ASCII byte in `data` is a
    /// programming error surfaced as [`SerialError::WriteFailed`].
    pub async fn write(&mut self, data: &str) -> Result<(), SerialError> {
        if !data.is_ascii() {
            return Err(SerialError::WriteFailed {
                reason: "attempted to write non-ASCII data to GRBL".to_string(),
            });
        }
        self.half
            .write_all(data.as_bytes())
            .await
            .map_err(|e| SerialError::WriteFailed {
                reason: e.to_string(),
            })
    }

    /// Write a single real-time byte (`?`, `!`, `~`, or 0x18) with no
    /// trailing newline.
    pub async fn write_byte(&mut self, byte: u8) -> Result<(), SerialError> {
        self.half
            .write_all(&[byte])
            .await
            .map_err(|e| SerialError::WriteFailed {
                reason: e.to_string(),
            })
    }
}

/// Read half of an open serial connection, accumulating cleaned lines.
pub struct SerialReader {
    half: tokio::io::ReadHalf<tokio_serial::SerialStream>,
    acc: LineAccumulator,
}

impl SerialReader {
    /// Read one chunk and return the cleaned, non-empty lines it
    /// completed. Awaits until at least one byte arrives or the port
    /// errors (an error or EOF both mean the device is gone).
    pub async fn read_chunk(&mut self) -> Result<Vec<String>, SerialError> {
        let mut buf = [0u8; 256];
        let n = self
            .half
            .read(&mut buf)
            .await
            .map_err(|e| SerialError::ReadFailed {
                reason: e.to_string(),
            })?;
        if n == 0 {
            return Err(SerialError::Disconnected);
        }
        Ok(self.acc.feed(&buf[..n]))
    }
}

/// Open a serial port and split it into an independent reader and
/// writer so the device engine can keep writing while a dedicated task
/// drains incoming lines.
pub async fn open_split(path: &str, baud_rate: u32) -> Result<(SerialWriter, SerialReader), SerialError> {
    let mut port = tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(|e| SerialError::FailedToOpen {
            port: path.to_string(),
            reason: e.to_string(),
        })?;
    port.clear(tokio_serial::ClearBuffer::Input)
        .map_err(|e| SerialError::ReadFailed {
            reason: e.to_string(),
        })?;
    let (read_half, write_half) = tokio::io::split(port);
    Ok((
        SerialWriter { half: write_half },
        SerialReader {
            half: read_half,
            acc: LineAccumulator::new(),
        },
    ))
}

/// Filter for ports worth offering as USB-ID/auto-discovery candidates:
/// the usual CNC-adapter device-name shapes across platforms.
fn is_valid_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

/// A discovered serial port and its USB identity, if any.
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Enumerate serial ports that look like CNC adapters.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, SerialError> {
    let ports = tokio_serial::available_ports().map_err(|e| SerialError::ReadFailed {
        reason: format!("failed to enumerate serial ports: {e}"),
    })?;
    Ok(ports
        .into_iter()
        .filter(|p| is_valid_cnc_port(&p.port_name))
        .map(|p| {
            let (vid, pid) = match &p.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid)),
                _ => (None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                vid,
                pid,
            }
        })
        .collect())
}

/// Parse a `"vvvv:pppp"` USB id into (vendor, product), both hex.
pub fn parse_usb_id(usb_id: &str) -> Result<(u16, u16), SerialError> {
    let (vid, pid) = usb_id
        .split_once(':')
        .ok_or_else(|| SerialError::InvalidUsbId(usb_id.to_string()))?;
    let vid = u16::from_str_radix(vid, 16).map_err(|_| SerialError::InvalidUsbId(usb_id.to_string()))?;
    let pid = u16::from_str_radix(pid, 16).map_err(|_| SerialError::InvalidUsbId(usb_id.to_string()))?;
    Ok((vid, pid))
}

/// Find the port path whose USB (vendor, product) matches `usb_id`.
pub fn find_port_by_usb_id(usb_id: &str) -> Result<String, SerialError> {
    let (vid, pid) = parse_usb_id(usb_id)?;
    list_ports()?
        .into_iter()
        .find(|p| p.vid == Some(vid) && p.pid == Some(pid))
        .map(|p| p.port_name)
        .ok_or_else(|| SerialError::PortNotFound {
            port: usb_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_esp_log_prefix_around_ok() {
        assert_eq!(clean_grbl_line("I (123) tag: ok"), "ok");
    }

    #[test]
    fn cleans_esp_log_prefix_around_error() {
        assert_eq!(clean_grbl_line("W (456) uart: error:9"), "error:9");
    }

    #[test]
    fn cleans_esp_log_prefix_around_alarm() {
        assert_eq!(clean_grbl_line("E (1) core: ALARM:1"), "ALARM:1");
    }

    #[test]
    fn keeps_status_report_verbatim() {
        assert_eq!(
            clean_grbl_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>"),
            "<Idle|MPos:0.000,0.000,0.000|FS:0,0>"
        );
    }

    #[test]
    fn keeps_version_banner() {
        assert_eq!(clean_grbl_line("Grbl 1.1h ['$' for help]"), "Grbl 1.1h ['$' for help]");
    }

    #[test]
    fn drops_line_with_no_recognizable_token() {
        assert_eq!(clean_grbl_line("booting wifi stack..."), "");
    }

    #[test]
    fn accumulator_splits_on_newline_and_drops_empties() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed(b"ok\n\n<Idle|MPos:0,0,0>\nbooting\n");
        assert_eq!(lines, vec!["ok".to_string(), "<Idle|MPos:0,0,0>".to_string()]);
    }

    #[test]
    fn accumulator_holds_partial_line_across_calls() {
        let mut acc = LineAccumulator::new();
        assert!(acc.feed(b"o").is_empty());
        assert_eq!(acc.feed(b"k\n"), vec!["ok".to_string()]);
    }

    #[test]
    fn accumulator_drops_non_ascii_bytes() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed(&[b'o', b'k', 0xff, b'\n']);
        assert_eq!(lines, vec!["ok".to_string()]);
    }

    #[test]
    fn parse_usb_id_accepts_hex_pair() {
        assert_eq!(parse_usb_id("1a86:7523").unwrap(), (0x1a86, 0x7523));
    }

    #[test]
    fn parse_usb_id_rejects_malformed_input() {
        assert!(parse_usb_id("not-an-id").is_err());
    }
}
