//! Production runs.
//!
//! Order validation, run state, the device wire vocabulary and the
//! [`RunController`] that sequences printing against the device handshake.

pub mod controller;
pub mod order;
pub mod protocol;
pub mod record;
pub mod state;

pub use controller::{ProductionSettings, RunController, RunOutcome, StopOutcome};
pub use order::{serial_number, Operator, ProductionOrder};
pub use protocol::DeviceProtocol;
pub use record::RunRecord;
pub use state::{ProductionRun, RunPhase, RunSnapshot, StopReason};
