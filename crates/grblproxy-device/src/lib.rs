//! Serial transport, GRBL line classification, and the device engine
//! that turns them into a character-counted streaming protocol.

pub mod codec;
pub mod engine;
pub mod parser;

pub use codec::{
    find_port_by_usb_id, list_ports, open_split, parse_usb_id, LineAccumulator, SerialPortInfo,
    SerialReader, SerialWriter, DEFAULT_RESPONSE_QUEUE_SIZE,
};
pub use engine::{
    spawn, spawn_dry_run, DeviceEngineConfig, DeviceHandle, DeviceTarget, ResponseSink,
    TriggerSink,
};
pub use parser::{is_immediate, is_soft_reset, is_terminator, parse_status};
