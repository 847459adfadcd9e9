//! Mock Hardware Implementations
//!
//! Simulated labeling device for testing without physical hardware. The
//! simulator sits on the far side of a `tokio::io::duplex` pipe and answers
//! commands the way the device firmware does:
//!
//! - start production → batch-ready signal
//! - advance unit → unit acknowledgment signal
//! - emergency stop → recorded, no reply
//!
//! Behaviour can be degraded to exercise edge cases: silence after the
//! handshake, diagnostic noise before each signal, failing opens, or a dropped
//! link.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = MockDevice::new();
//! let chooser = MockChooser::granting(device.clone());
//! let session = DeviceSession::new(Arc::new(chooser), SessionConfig::default());
//! session.request_access().await?;
//! session.connect().await?;
//! ```

use super::link::{DeviceChooser, DeviceHandle, DeviceReader, DeviceWriter};
use crate::production::protocol::DeviceProtocol;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Firmware reply behaviour.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Reply to the start command with the batch-ready signal
    pub ready_on_start: bool,
    /// Reply to each advance command with the unit acknowledgment
    pub ack_units: bool,
    /// Delay before each reply
    pub response_delay: Duration,
    /// Line written before every reply (diagnostic chatter)
    pub noise: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            ready_on_start: true,
            ack_units: true,
            response_delay: Duration::from_millis(5),
            noise: None,
        }
    }
}

struct MockInner {
    name: String,
    protocol: DeviceProtocol,
    behavior: Mutex<MockBehavior>,
    commands: Mutex<Vec<String>>,
    open_count: AtomicUsize,
    fail_open: AtomicBool,
    device_tx: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    link_task: Mutex<Option<JoinHandle<()>>>,
}

/// Simulated labeling device.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockInner>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a cooperative device using the default wire vocabulary.
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// Create a device with custom reply behaviour.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self::with_protocol(DeviceProtocol::default(), behavior)
    }

    /// Create a device speaking a custom vocabulary.
    pub fn with_protocol(protocol: DeviceProtocol, behavior: MockBehavior) -> Self {
        Self {
            inner: Arc::new(MockInner {
                name: "mock-labeler".to_string(),
                protocol,
                behavior: Mutex::new(behavior),
                commands: Mutex::new(Vec::new()),
                open_count: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
                device_tx: tokio::sync::Mutex::new(None),
                link_task: Mutex::new(None),
            }),
        }
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many times `command` was received.
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    /// Make subsequent opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Replace the reply behaviour.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self
            .inner
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Emit an arbitrary line from the device side.
    pub async fn inject(&self, line: &str) -> Result<()> {
        let mut guard = self.inner.device_tx.lock().await;
        let writer = guard.as_mut().ok_or_else(|| anyhow!("Mock link not open"))?;
        writer.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    /// Tear the link down from the device side; the host reader sees EOF.
    pub async fn drop_link(&self) {
        let task = self
            .inner
            .link_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.device_tx.lock().await.take();
    }

    fn behavior(&self) -> MockBehavior {
        self.inner
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn reply(&self, signal: &str) -> Result<()> {
        let behavior = self.behavior();
        sleep(behavior.response_delay).await;
        if let Some(noise) = &behavior.noise {
            self.inject(noise).await?;
        }
        self.inject(signal).await
    }

    async fn handle_command(&self, command: String) -> Result<()> {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());

        let behavior = self.behavior();
        let protocol = &self.inner.protocol;
        if command == protocol.start && behavior.ready_on_start {
            self.reply(&protocol.batch_ready).await?;
        } else if command == protocol.advance && behavior.ack_units {
            self.reply(&protocol.unit_ack).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceHandle for MockDevice {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    async fn open(&self, _baud_rate: u32) -> Result<(DeviceReader, DeviceWriter)> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(anyhow!("Mock device refused to open"));
        }

        self.drop_link().await;

        let (host, device) = tokio::io::duplex(1024);
        let (device_rx, device_tx) = tokio::io::split(device);
        *self.inner.device_tx.lock().await = Some(device_tx);

        let firmware = self.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(device_rx).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command = line.trim().to_string();
                if command.is_empty() {
                    continue;
                }
                if let Err(e) = firmware.handle_command(command).await {
                    tracing::warn!("Mock device reply failed: {}", e);
                    break;
                }
            }
        });
        *self
            .inner
            .link_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.inner.open_count.fetch_add(1, Ordering::SeqCst);
        let (host_rx, host_tx) = tokio::io::split(host);
        Ok((Box::new(host_rx), Box::new(host_tx)))
    }
}

/// Chooser that grants a fixed handle or simulates a cancelled prompt.
pub struct MockChooser {
    handle: Option<Arc<dyn DeviceHandle>>,
}

impl MockChooser {
    /// Always grant `device`.
    pub fn granting(device: impl DeviceHandle + 'static) -> Self {
        Self {
            handle: Some(Arc::new(device)),
        }
    }

    /// Always behave as if the operator cancelled.
    pub fn cancelling() -> Self {
        Self { handle: None }
    }
}

#[async_trait]
impl DeviceChooser for MockChooser {
    async fn choose(&self) -> Result<Option<Arc<dyn DeviceHandle>>> {
        Ok(self.handle.clone())
    }
}
