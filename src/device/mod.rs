//! Device session layer: connection lifecycle and the sequenced transcript used
//! for signal correlation.

pub mod log;
pub mod session;

pub use log::{DeviceLog, Direction, LogEntry, WaitError};
pub use session::{ConnectionState, DeviceSession, SessionConfig};
