//! Device session controller.
//!
//! Owns at most one connection to the labeling device and exposes:
//! - `request_access()` → host chooser prompt, stores the granted handle
//! - `connect()` → opens the handle, starts the read loop
//! - `send()` → fire-and-forget, line-terminated command write
//! - `disconnect()` → closes the link, safe to repeat
//!
//! All device I/O failures end up as a [`DeviceLog`] status entry plus a
//! [`ConnectionState`] transition; none of them tear down the host process.
//!
//! # Read loop
//!
//! The read loop decodes incoming bytes, splits on newline and appends each
//! complete line to the log as a received entry. When the transport fails it
//! moves the session to `Failed` and, if enabled, reopens the same handle once
//! after `reconnect_delay`. There is no timer-driven retry.

use super::log::{DeviceLog, Direction, LogEntry, WaitError};
use crate::config::DeviceConfig;
use crate::error::{AppResult, ProdlineError};
use crate::hardware::{DeviceChooser, DeviceHandle, DeviceReader, DeviceWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link open
    Disconnected,
    /// Open in progress
    Connecting,
    /// Link open, read loop running
    Connected,
    /// Last open or transport operation failed
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Session link settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed baud rate
    pub baud_rate: u32,
    /// Appended to every command
    pub line_terminator: String,
    /// Reopen once after a read-loop failure
    pub reconnect_on_read_error: bool,
    /// Delay before that reopen
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&DeviceConfig::default())
    }
}

impl From<&DeviceConfig> for SessionConfig {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            line_terminator: config.line_terminator.clone(),
            reconnect_on_read_error: config.reconnect_on_read_error,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

struct SessionInner {
    chooser: Arc<dyn DeviceChooser>,
    config: SessionConfig,
    handle: Mutex<Option<Arc<dyn DeviceHandle>>>,
    writer: Mutex<Option<DeviceWriter>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<ConnectionState>,
    log: DeviceLog,
}

/// Explicitly owned device session, shared by cloning.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Create a disconnected session that asks `chooser` for device access.
    pub fn new(chooser: Arc<dyn DeviceChooser>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                chooser,
                config,
                handle: Mutex::new(None),
                writer: Mutex::new(None),
                read_task: std::sync::Mutex::new(None),
                state,
                log: DeviceLog::new(),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether commands can currently be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The session transcript.
    pub fn log(&self) -> &DeviceLog {
        &self.inner.log
    }

    /// Name of the granted device, if any.
    pub async fn device_name(&self) -> Option<String> {
        self.inner.handle.lock().await.as_ref().map(|h| h.name())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Device connection state changed");
        }
    }

    fn status(&self, text: impl Into<String>) {
        self.inner.log.append(Direction::Status, text);
    }

    /// Prompt for a device and remember the granted handle.
    pub async fn request_access(&self) -> AppResult<()> {
        match self.inner.chooser.choose().await {
            Ok(Some(handle)) => {
                let name = handle.name();
                *self.inner.handle.lock().await = Some(handle);
                self.status(format!("Access granted to {name}"));
                info!(device = %name, "Device access granted");
                Ok(())
            }
            Ok(None) => {
                self.status("Device access request cancelled");
                Err(ProdlineError::PermissionDenied(
                    "no device was selected".to_string(),
                ))
            }
            Err(e) => {
                self.status(format!("Device access request failed: {e:#}"));
                Err(ProdlineError::DeviceIo(format!("{e:#}")))
            }
        }
    }

    /// Open the granted device and start the read loop.
    ///
    /// On failure the session is left in `Failed` for the caller to retry.
    pub async fn connect(&self) -> AppResult<()> {
        let handle = self.inner.handle.lock().await.clone().ok_or_else(|| {
            ProdlineError::PermissionDenied("no device granted; request access first".into())
        })?;

        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match handle.open(self.inner.config.baud_rate).await {
            Ok((reader, writer)) => {
                *self.inner.writer.lock().await = Some(writer);
                self.set_state(ConnectionState::Connected);
                self.status(format!(
                    "Connected to {} at {} baud",
                    handle.name(),
                    self.inner.config.baud_rate
                ));

                let session = self.clone();
                let task = tokio::spawn(async move { session.read_loop(handle, reader).await });
                let previous = self
                    .inner
                    .read_task
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(task);
                if let Some(previous) = previous {
                    previous.abort();
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                self.status(format!("Connection to {} failed: {e:#}", handle.name()));
                warn!(device = %handle.name(), "Device connection failed: {e:#}");
                Err(ProdlineError::DeviceIo(format!("{e:#}")))
            }
        }
    }

    /// Write `command` followed by the line terminator.
    ///
    /// Returns `Ok(false)` without writing when the session is not connected; the
    /// skipped command is recorded in the log. A failed write moves the session to
    /// `Failed`.
    pub async fn send(&self, command: &str) -> AppResult<bool> {
        let mut guard = self.inner.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.is_connected() => writer,
            _ => {
                self.status(format!("Cannot send '{command}': device not connected"));
                warn!(command, "Command dropped, device not connected");
                return Ok(false);
            }
        };

        let line = format!("{command}{}", self.inner.config.line_terminator);
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                self.inner.log.append(Direction::Sent, command);
                Ok(true)
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.set_state(ConnectionState::Failed);
                self.status(format!("Write of '{command}' failed: {e}"));
                Err(ProdlineError::DeviceIo(format!(
                    "write of '{command}' failed: {e}"
                )))
            }
        }
    }

    /// Close the link. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let task = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("Device writer shutdown failed: {}", e);
            }
        }

        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.status("Disconnected");
        }
    }

    /// Wait for a received line equal to `expected`, appended after `since`.
    pub async fn wait_for_signal(
        &self,
        expected: &str,
        since: u64,
        timeout: Option<Duration>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<LogEntry, WaitError> {
        self.inner
            .log
            .wait_for(expected, since, timeout, cancel)
            .await
    }

    async fn read_loop(self, handle: Arc<dyn DeviceHandle>, mut reader: DeviceReader) {
        let mut reconnect_budget = usize::from(self.inner.config.reconnect_on_read_error);

        loop {
            let reason = self.pump_lines(reader).await;
            self.inner.writer.lock().await.take();
            self.set_state(ConnectionState::Failed);
            self.status(format!("Read loop stopped: {reason}"));
            warn!(device = %handle.name(), "Device read loop stopped: {}", reason);

            if reconnect_budget == 0 {
                return;
            }
            reconnect_budget -= 1;

            tokio::time::sleep(self.inner.config.reconnect_delay).await;
            self.set_state(ConnectionState::Connecting);
            match handle.open(self.inner.config.baud_rate).await {
                Ok((next_reader, writer)) => {
                    *self.inner.writer.lock().await = Some(writer);
                    self.set_state(ConnectionState::Connected);
                    self.status(format!("Reconnected to {}", handle.name()));
                    reader = next_reader;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Failed);
                    self.status(format!("Reconnect to {} failed: {e:#}", handle.name()));
                    return;
                }
            }
        }
    }

    /// Append complete lines until the transport fails; returns the reason.
    async fn pump_lines(&self, reader: DeviceReader) -> String {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(64);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return "device closed the connection".to_string(),
                Ok(_) => {
                    // A trailing fragment without newline only shows up right before EOF.
                    if buf.last() != Some(&b'\n') {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        self.inner.log.append(Direction::Received, line);
                    }
                }
                Err(e) => return format!("read error: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockChooser, MockDevice};

    fn session_for(device: &MockDevice) -> DeviceSession {
        DeviceSession::new(
            Arc::new(MockChooser::granting(device.clone())),
            SessionConfig {
                reconnect_delay: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_connect_without_access_is_denied() {
        let session = session_for(&MockDevice::new());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ProdlineError::PermissionDenied(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_access() {
        let session = DeviceSession::new(
            Arc::new(MockChooser::cancelling()),
            SessionConfig::default(),
        );
        let err = session.request_access().await.unwrap_err();
        assert!(matches!(err, ProdlineError::PermissionDenied(_)));
        assert_eq!(session.log().len(), 1);
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_logged_noop() {
        let device = MockDevice::new();
        let session = session_for(&device);

        assert!(!session.send("3").await.unwrap());
        let entries = session.log().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Status);
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let device = MockDevice::new();
        let session = session_for(&device);
        session.request_access().await.unwrap();
        session.connect().await.unwrap();

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.send("4").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_failed_state() {
        let device = MockDevice::new();
        device.set_fail_open(true);
        let session = session_for(&device);
        session.request_access().await.unwrap();

        assert!(matches!(
            session.connect().await,
            Err(ProdlineError::DeviceIo(_))
        ));
        assert_eq!(session.state(), ConnectionState::Failed);

        device.set_fail_open(false);
        session.connect().await.unwrap();
        assert!(session.is_connected());
    }
}
