//! Production run state.
//!
//! [`RunPhase`] is the controller's state machine; [`ProductionRun`] is the
//! single authoritative value object holding a run's counters. All counter
//! mutation goes through [`ProductionRun::record_print`].
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> AwaitingTarget ──target──> PrintingInitialBatch
//!  ▲                   │                          │
//!  │                 cancel          batch < target│   batch == target
//!  │                   ▼                          ▼          │
//!  ├──────────────── Idle          AwaitingDeviceReady       │
//!  │                                         │ ready         │
//!  │                                         ▼               │
//!  │                                     Producing ──────────┤
//!  │                                                         ▼
//!  └──dismiss── Saved <──finalize── Stopping <──stop (any active phase)
//! ```

use super::order::serial_number;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Production run controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    /// No run in progress
    Idle,
    /// Order accepted, waiting for the operator's target count
    AwaitingTarget,
    /// Printing the first labels without device handshake
    PrintingInitialBatch,
    /// Start command sent, waiting for the batch-ready signal
    AwaitingDeviceReady,
    /// Per-unit advance/acknowledge/print loop
    Producing,
    /// Emergency stop sent, finalization pending or failed
    Stopping,
    /// Run persisted, summary shown
    Saved,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "Idle"),
            RunPhase::AwaitingTarget => write!(f, "AwaitingTarget"),
            RunPhase::PrintingInitialBatch => write!(f, "PrintingInitialBatch"),
            RunPhase::AwaitingDeviceReady => write!(f, "AwaitingDeviceReady"),
            RunPhase::Producing => write!(f, "Producing"),
            RunPhase::Stopping => write!(f, "Stopping"),
            RunPhase::Saved => write!(f, "Saved"),
        }
    }
}

impl RunPhase {
    /// Whether a run is printing or waiting on the device.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunPhase::PrintingInitialBatch | RunPhase::AwaitingDeviceReady | RunPhase::Producing
        )
    }

    /// Whether a new run can be requested.
    pub fn can_begin(&self) -> bool {
        matches!(self, RunPhase::Idle)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator pressed stop
    Operator,
    /// Emergency stop
    Emergency,
    /// Target count reached
    Completed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Operator => write!(f, "operator stop"),
            StopReason::Emergency => write!(f, "emergency stop"),
            StopReason::Completed => write!(f, "target reached"),
        }
    }
}

/// In-memory labeling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRun {
    target: u32,
    printed: u32,
    start_count: u32,
    started_at: DateTime<Local>,
    completed: bool,
    batch: String,
    serials: Vec<String>,
}

impl ProductionRun {
    /// Start a run of `target` units for `batch`. `target` must be positive.
    pub fn new(target: u32, batch: impl Into<String>, started_at: DateTime<Local>) -> Self {
        Self {
            target,
            printed: 0,
            start_count: 0,
            started_at,
            completed: false,
            batch: batch.into(),
            serials: Vec::with_capacity(target.min(1024) as usize),
        }
    }

    /// Target unit count.
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Labels printed so far.
    pub fn printed(&self) -> u32 {
        self.printed
    }

    /// Counter value at run start.
    pub fn start_count(&self) -> u32 {
        self.start_count
    }

    /// Run start timestamp, captured once.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Whether the target count was reached.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Batch identifier.
    pub fn batch(&self) -> &str {
        &self.batch
    }

    /// Serial numbers of printed labels, in print order.
    pub fn serials(&self) -> &[String] {
        &self.serials
    }

    /// Units left to print.
    pub fn remaining(&self) -> u32 {
        self.target - self.printed
    }

    /// Serial number for the next label, or `None` when the target is reached.
    pub fn next_serial(&self) -> Option<String> {
        (self.printed < self.target).then(|| serial_number(&self.batch, self.printed + 1))
    }

    /// Count a confirmed print. Returns `false` (and changes nothing) once the
    /// target has been reached.
    pub fn record_print(&mut self, serial: String) -> bool {
        if self.printed >= self.target {
            return false;
        }
        self.printed += 1;
        self.serials.push(serial);
        self.completed = self.printed == self.target;
        true
    }
}

/// Point-in-time view of the controller for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    /// Current phase
    pub phase: RunPhase,
    /// Target count (0 without a run)
    pub target: u32,
    /// Printed count (0 without a run)
    pub printed: u32,
    /// Serial numbers generated
    pub serial_count: usize,
    /// Run start, if a run exists
    pub started_at: Option<DateTime<Local>>,
    /// Stop reason once stopping
    pub stop_reason: Option<StopReason>,
    /// Most recent surfaced error
    pub last_error: Option<String>,
}
