//! Configuration System using Figment
//!
//! Strongly-typed configuration for the labeling line. Configuration is loaded from:
//! 1. `config/prodline.toml` (or an explicit path)
//! 2. Environment variables prefixed with `PRODLINE_`, using `__` between
//!    section and key (e.g. `PRODLINE_DEVICE__PORT=/dev/ttyUSB0`)
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use prodline::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Baud rate: {}", config.device.baud_rate);
//! # Ok::<(), prodline::error::ProdlineError>(())
//! ```

use crate::error::{AppResult, ProdlineError};
use crate::production::protocol::DeviceProtocol;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/prodline.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial device settings
    #[serde(default)]
    pub device: DeviceConfig,
    /// Production run pacing and wire vocabulary
    #[serde(default)]
    pub production: ProductionConfig,
    /// Label printer settings
    #[serde(default)]
    pub printer: PrinterConfig,
    /// Run log storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port path. When unset the chooser picks the only available port.
    #[serde(default)]
    pub port: Option<String>,
    /// Fixed baud rate used by the device firmware
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Terminator appended to every outbound command
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Reopen the port once after a read-loop failure
    #[serde(default = "default_true")]
    pub reconnect_on_read_error: bool,
    /// Delay before the read-loop reconnect attempt
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

/// Production run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionConfig {
    /// Labels printed before the device handshake begins
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: u32,
    /// Pause between the emergency stop command and finalization
    #[serde(default = "default_stop_settle", with = "humantime_serde")]
    pub stop_settle: Duration,
    /// Upper bound on a single signal wait. Unset waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub signal_timeout: Option<Duration>,
    /// Device wire vocabulary
    #[serde(default)]
    pub protocol: DeviceProtocol,
}

/// Label printer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    /// Directory where rendered label payloads are spooled
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// How long to wait for print confirmation before assuming success
    #[serde(default = "default_fallback_timeout", with = "humantime_serde")]
    pub fallback_timeout: Duration,
}

/// Run log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for finalized run records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "prodline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_initial_batch_size() -> u32 {
    20
}

fn default_stop_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("spool")
}

fn default_fallback_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("prodline").join("runs"))
        .unwrap_or_else(|| PathBuf::from("runs"))
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            line_terminator: default_line_terminator(),
            reconnect_on_read_error: true,
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: default_initial_batch_size(),
            stop_settle: default_stop_settle(),
            signal_timeout: None,
            protocol: DeviceProtocol::default(),
        }
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            fallback_timeout: default_fallback_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/prodline.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PRODLINE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ProdlineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ProdlineError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.baud_rate == 0 {
            return Err(ProdlineError::Configuration(
                "device.baud_rate must be greater than zero".into(),
            ));
        }

        if self.device.line_terminator.is_empty() {
            return Err(ProdlineError::Configuration(
                "device.line_terminator must not be empty".into(),
            ));
        }

        if self.production.initial_batch_size == 0 {
            return Err(ProdlineError::Configuration(
                "production.initial_batch_size must be greater than zero".into(),
            ));
        }

        if self.production.signal_timeout == Some(Duration::ZERO) {
            return Err(ProdlineError::Configuration(
                "production.signal_timeout must be greater than zero when set".into(),
            ));
        }

        self.production
            .protocol
            .validate()
            .map_err(ProdlineError::Configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.production.initial_batch_size, 20);
        assert!(config.production.signal_timeout.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "prodline");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prodline.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[device]
port = "/dev/ttyACM0"
baud_rate = 115200

[production]
initial_batch_size = 5
signal_timeout = "30s"

[production.protocol]
advance = "7"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.device.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.device.baud_rate, 115200);
        assert_eq!(config.production.initial_batch_size, 5);
        assert_eq!(
            config.production.signal_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.production.protocol.advance, "7");
        assert_eq!(config.production.protocol.unit_ack, "1");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = AppConfig::default();
        config.production.initial_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ProdlineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_signal_timeout_rejected() {
        let mut config = AppConfig::default();
        config.production.signal_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
