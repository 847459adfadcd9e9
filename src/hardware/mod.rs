//! Hardware Links
//!
//! Low-level access to the labeling device: how a port is chosen, opened and
//! split into async reader/writer halves. The device session builds its
//! connection lifecycle on top of these traits.

pub mod link;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

pub use link::{DeviceChooser, DeviceHandle, DeviceReader, DeviceWriter};
#[cfg(feature = "serial")]
pub use serial::{SerialDeviceHandle, SerialPortChooser};
