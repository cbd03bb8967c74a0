//! Core types shared by every layer of the GRBL GCode proxy: client
//! identity, device status, the task model, and the aggregated error
//! type. No I/O lives here.

pub mod device_state;
pub mod error;
pub mod ids;
pub mod task;

pub use device_state::{DeviceState, DeviceStatus, HomingPhase};
pub use error::{Error, Result, SerialError, TaskError, TriggerError};
pub use ids::ClientId;
pub use task::{GCodeTask, ShellTask, Task};
