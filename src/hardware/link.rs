//! Device access capabilities.
//!
//! Two small async traits separate *choosing* a device (the host permission
//! prompt) from *opening* it at a given baud rate:
//!
//! - [`DeviceChooser`] resolves to a granted [`DeviceHandle`], or `None` when the
//!   operator cancels.
//! - [`DeviceHandle`] opens the link and hands back boxed reader/writer halves, so
//!   a physical serial port and an in-memory simulator look identical to the
//!   session.
//!
//! Both use `anyhow::Result`; the session converts failures into log entries and
//! state transitions.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Read half of an open device link.
pub type DeviceReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an open device link.
pub type DeviceWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A device the operator has granted access to.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// Human-readable device name (port path, simulator id).
    fn name(&self) -> String;

    /// Open the link at `baud_rate`.
    ///
    /// May be called again after a failure to reopen the same device.
    async fn open(&self, baud_rate: u32) -> Result<(DeviceReader, DeviceWriter)>;
}

/// Host device-chooser prompt.
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    /// Ask for a device. `Ok(None)` means the request was cancelled.
    async fn choose(&self) -> Result<Option<Arc<dyn DeviceHandle>>>;
}
