//! Custom error types for the application.
//!
//! This module defines the primary error type, `ProdlineError`, for the whole crate.
//! Using the `thiserror` crate, it provides a consistent way to report what went
//! wrong while driving the labeling device, printing labels or saving a run.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment parse failures and semantic
//!   validation failures of the loaded configuration.
//! - **`Validation`**: operator input or precondition problems (no order selected,
//!   device not connected, bad target count). The operation is aborted and the
//!   run state is left untouched.
//! - **`PermissionDenied`**: the device chooser was cancelled or found nothing.
//! - **`DeviceIo`** / **`SignalTimeout`**: serial write/read failures and bounded
//!   signal waits that ran out.
//! - **`Print`**: the label printer failed; counters are not advanced.
//! - **`Persistence`**: the run store rejected the finalized record; counters are
//!   kept so `finalize` can be retried.
//!
//! None of these are process-fatal. Collaborator traits (printers, stores, device
//! handles) return `anyhow::Result`; the run controller maps those failures into
//! the typed variants here.

use crate::production::state::RunPhase;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ProdlineError>;

/// Precondition and input failures reported inline to the operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No production order has been selected.
    #[error("No production order selected")]
    NoOrderSelected,

    /// The selected order is missing required fields.
    #[error("Production order is incomplete, missing: {}", .0.join(", "))]
    IncompleteOrder(Vec<String>),

    /// The labeling device is not connected.
    #[error("Device is not connected")]
    DeviceNotConnected,

    /// The target count was not a positive integer.
    #[error("Target count must be a positive integer, got '{0}'")]
    InvalidTarget(String),

    /// A stop or finalize was requested without a run in progress.
    #[error("No production run is active")]
    NoActiveRun,
}

/// Application error type.
#[derive(Error, Debug)]
pub enum ProdlineError {
    /// Configuration could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure (files, spool directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operator input or precondition failure.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Device chooser cancelled or no device granted.
    #[error("Device access denied: {0}")]
    PermissionDenied(String),

    /// Serial open, write or read failure.
    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    /// A bounded signal wait elapsed without the expected signal.
    #[error("Timed out after {waited:?} waiting for device signal '{signal}'")]
    SignalTimeout {
        /// Expected signal code
        signal: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// Label printing failed.
    #[error("Print error: {0}")]
    Print(String),

    /// The run store rejected the finalized record.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation not allowed in the current run phase.
    #[error("Cannot {operation} while run is {phase}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Phase the controller was in
        phase: RunPhase,
    },

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for ProdlineError {
    fn from(value: figment::Error) -> Self {
        ProdlineError::Config(Box::new(value))
    }
}

impl ProdlineError {
    /// Whether the operator can retry or continue after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProdlineError::Config(_)
            | ProdlineError::Configuration(_)
            | ProdlineError::SerialFeatureDisabled => false,
            ProdlineError::Io(_)
            | ProdlineError::Validation(_)
            | ProdlineError::PermissionDenied(_)
            | ProdlineError::DeviceIo(_)
            | ProdlineError::SignalTimeout { .. }
            | ProdlineError::Print(_)
            | ProdlineError::Persistence(_)
            | ProdlineError::InvalidState { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_order_lists_missing_fields() {
        let err = ValidationError::IncompleteOrder(vec!["batch".into(), "material".into()]);
        assert_eq!(
            err.to_string(),
            "Production order is incomplete, missing: batch, material"
        );
    }

    #[test]
    fn validation_converts_into_app_error() {
        let err: ProdlineError = ValidationError::DeviceNotConnected.into();
        assert!(matches!(
            err,
            ProdlineError::Validation(ValidationError::DeviceNotConnected)
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        assert!(!ProdlineError::Configuration("bad".into()).is_recoverable());
        assert!(!ProdlineError::SerialFeatureDisabled.is_recoverable());
        assert!(ProdlineError::Persistence("disk full".into()).is_recoverable());
    }

    #[test]
    fn invalid_state_names_phase() {
        let err = ProdlineError::InvalidState {
            operation: "start",
            phase: RunPhase::Producing,
        };
        assert_eq!(err.to_string(), "Cannot start while run is Producing");
    }
}
