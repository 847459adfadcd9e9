//! Labeling device wire vocabulary.
//!
//! Protocol Overview:
//! - Format: bare ASCII codes, one per line (newline delimited)
//! - Outbound commands: numeric strings (start production, advance one unit,
//!   emergency stop)
//! - Inbound signals: single characters ("1" = unit acknowledged,
//!   "2" = batch ready)
//!
//! The codes are fixed by the device firmware. They are configurable only so a
//! firmware revision can be matched without a rebuild.

use serde::{Deserialize, Serialize};

/// Command that switches the device into production mode.
pub const START_PRODUCTION: &str = "3";
/// Command that advances the line by one unit.
pub const ADVANCE_UNIT: &str = "4";
/// Command that halts the line immediately.
pub const EMERGENCY_STOP: &str = "9";
/// Signal emitted after each advanced unit.
pub const UNIT_ACK: &str = "1";
/// Signal emitted once the device is ready for per-unit commands.
pub const BATCH_READY: &str = "2";

/// Outbound command and inbound signal codes understood by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProtocol {
    /// Start production command
    #[serde(default = "default_start")]
    pub start: String,
    /// Per-unit advance command
    #[serde(default = "default_advance")]
    pub advance: String,
    /// Emergency stop command
    #[serde(default = "default_emergency_stop")]
    pub emergency_stop: String,
    /// Per-unit acknowledgment signal
    #[serde(default = "default_unit_ack")]
    pub unit_ack: String,
    /// Batch-ready signal
    #[serde(default = "default_batch_ready")]
    pub batch_ready: String,
}

fn default_start() -> String {
    START_PRODUCTION.to_string()
}

fn default_advance() -> String {
    ADVANCE_UNIT.to_string()
}

fn default_emergency_stop() -> String {
    EMERGENCY_STOP.to_string()
}

fn default_unit_ack() -> String {
    UNIT_ACK.to_string()
}

fn default_batch_ready() -> String {
    BATCH_READY.to_string()
}

impl Default for DeviceProtocol {
    fn default() -> Self {
        Self {
            start: default_start(),
            advance: default_advance(),
            emergency_stop: default_emergency_stop(),
            unit_ack: default_unit_ack(),
            batch_ready: default_batch_ready(),
        }
    }
}

impl DeviceProtocol {
    /// Check that every code is usable on a newline-delimited link.
    pub fn validate(&self) -> Result<(), String> {
        let codes = [
            ("start", &self.start),
            ("advance", &self.advance),
            ("emergency_stop", &self.emergency_stop),
            ("unit_ack", &self.unit_ack),
            ("batch_ready", &self.batch_ready),
        ];

        for (name, code) in codes {
            if code.trim().is_empty() {
                return Err(format!("protocol.{name} must not be empty"));
            }
            if code.contains(['\n', '\r']) {
                return Err(format!("protocol.{name} must not contain line breaks"));
            }
        }

        let commands = [&self.start, &self.advance, &self.emergency_stop];
        for (i, a) in commands.iter().enumerate() {
            if commands[i + 1..].contains(a) {
                return Err(format!("Duplicate protocol command code '{a}'"));
            }
        }

        if self.unit_ack == self.batch_ready {
            return Err(format!(
                "protocol.unit_ack and protocol.batch_ready are both '{}'",
                self.unit_ack
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocabulary() {
        let protocol = DeviceProtocol::default();
        assert_eq!(protocol.unit_ack, "1");
        assert_eq!(protocol.batch_ready, "2");
        assert!(protocol.validate().is_ok());
    }

    #[test]
    fn test_duplicate_commands_rejected() {
        let protocol = DeviceProtocol {
            advance: START_PRODUCTION.to_string(),
            ..Default::default()
        };
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn test_identical_signals_rejected() {
        let protocol = DeviceProtocol {
            batch_ready: UNIT_ACK.to_string(),
            ..Default::default()
        };
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn test_line_break_rejected() {
        let protocol = DeviceProtocol {
            emergency_stop: "9\n".to_string(),
            ..Default::default()
        };
        assert!(protocol.validate().is_err());
    }
}
