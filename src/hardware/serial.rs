//! Serial port access via tokio-serial.
//!
//! The labeling device enumerates as a USB-serial port and speaks a
//! newline-delimited ASCII protocol at a fixed baud rate, 8N1, no flow control.

use super::link::{DeviceChooser, DeviceHandle, DeviceReader, DeviceWriter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo};
use tracing::{debug, info};

/// Handle to a named serial port.
#[derive(Debug, Clone)]
pub struct SerialDeviceHandle {
    port_path: String,
}

impl SerialDeviceHandle {
    /// Create a handle for `port_path` (e.g. "/dev/ttyUSB0", "COM3").
    pub fn new(port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
        }
    }
}

#[async_trait]
impl DeviceHandle for SerialDeviceHandle {
    fn name(&self) -> String {
        self.port_path.clone()
    }

    async fn open(&self, baud_rate: u32) -> Result<(DeviceReader, DeviceWriter)> {
        let port = tokio_serial::new(&self.port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port {}", self.port_path))?;

        debug!(port = %self.port_path, baud_rate, "Serial port opened");
        let (reader, writer) = tokio::io::split(port);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// List serial ports visible to the host.
pub fn available_ports() -> Result<Vec<SerialPortInfo>> {
    tokio_serial::available_ports().context("Failed to enumerate serial ports")
}

/// Chooses a serial port without user interaction.
///
/// A configured port path is granted as-is. Otherwise the chooser grants the
/// only enumerated port, and declines when there are none or several.
#[derive(Debug, Clone, Default)]
pub struct SerialPortChooser {
    preferred: Option<String>,
}

impl SerialPortChooser {
    /// Create a chooser, optionally pinned to a port path.
    pub fn new(preferred: Option<String>) -> Self {
        Self { preferred }
    }
}

#[async_trait]
impl DeviceChooser for SerialPortChooser {
    async fn choose(&self) -> Result<Option<Arc<dyn DeviceHandle>>> {
        if let Some(path) = &self.preferred {
            info!(port = %path, "Using configured serial port");
            return Ok(Some(Arc::new(SerialDeviceHandle::new(path.clone()))));
        }

        let ports = available_ports()?;
        match ports.as_slice() {
            [only] => {
                info!(port = %only.port_name, "Using the only available serial port");
                Ok(Some(Arc::new(SerialDeviceHandle::new(only.port_name.clone()))))
            }
            [] => Ok(None),
            many => {
                let names: Vec<&str> = many.iter().map(|p| p.port_name.as_str()).collect();
                info!(ports = ?names, "Several serial ports found; configure device.port");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preferred_port_is_granted() {
        let chooser = SerialPortChooser::new(Some("/dev/ttyUSB7".into()));
        let handle = chooser.choose().await.unwrap().unwrap();
        assert_eq!(handle.name(), "/dev/ttyUSB7");
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let handle = SerialDeviceHandle::new("/dev/prodline-does-not-exist");
        assert!(handle.open(9600).await.is_err());
    }
}
