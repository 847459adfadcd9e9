//! Append-only device transcript.
//!
//! Every line sent to or received from the labeling device is stored with a
//! monotonically increasing sequence number. Waiters record the sequence at the
//! moment their wait begins and only consider entries appended after it, so a
//! stale signal left over from a previous unit can never satisfy a new wait.
//!
//! Appends are published through a `tokio::sync::watch` channel carrying the
//! latest sequence number; waiters sleep on it instead of polling.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Command written to the device
    Sent,
    /// Line received from the device
    Received,
    /// Session status change or failure description
    Status,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Sent => write!(f, ">>"),
            Direction::Received => write!(f, "<<"),
            Direction::Status => write!(f, "--"),
        }
    }
}

/// A single timestamped transcript line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Sequence number, starting at 1
    pub seq: u64,
    /// Local time the entry was appended
    pub timestamp: DateTime<Local>,
    /// Entry origin
    pub direction: Direction,
    /// Line text without terminator
    pub text: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            self.text
        )
    }
}

/// Why a signal wait ended without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The bounded wait elapsed
    TimedOut(Duration),
    /// The cancellation flag was raised
    Cancelled,
}

/// Thread-safe, append-only transcript shared by a device session and its observers.
///
/// # Example
///
/// ```
/// use prodline::device::{DeviceLog, Direction};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let log = DeviceLog::new();
/// let since = log.cursor();
/// log.append(Direction::Received, "2");
///
/// let hit = log
///     .wait_for("2", since, Some(Duration::from_millis(100)), None)
///     .await
///     .unwrap();
/// assert_eq!(hit.seq, 1);
/// # })
/// ```
#[derive(Clone)]
pub struct DeviceLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    latest: Arc<watch::Sender<u64>>,
}

impl Default for DeviceLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            latest: Arc::new(latest),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        // Entries are only ever pushed, so a poisoned guard is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line and notify waiters. Returns the new sequence number.
    pub fn append(&self, direction: Direction, text: impl Into<String>) -> u64 {
        let text = text.into();
        let mut entries = self.lock();
        let seq = entries.len() as u64 + 1;
        tracing::debug!(target: "prodline::device", seq, %direction, text = %text);
        entries.push(LogEntry {
            seq,
            timestamp: Local::now(),
            direction,
            text,
        });
        // Published under the lock so the cursor never runs behind or backwards.
        self.latest.send_replace(seq);
        seq
    }

    /// Sequence number of the most recent entry (0 when empty).
    pub fn cursor(&self) -> u64 {
        *self.latest.borrow()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of all entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    /// Entries appended strictly after `seq`.
    pub fn entries_since(&self, seq: u64) -> Vec<LogEntry> {
        let entries = self.lock();
        let start = (seq as usize).min(entries.len());
        entries[start..].to_vec()
    }

    /// Subscribe to append notifications (value is the latest sequence number).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }

    fn find_received(&self, after: u64, upto: u64, expected: &str) -> Option<LogEntry> {
        let entries = self.lock();
        let start = (after as usize).min(entries.len());
        let end = (upto as usize).min(entries.len());
        entries[start..end]
            .iter()
            .find(|e| e.direction == Direction::Received && e.text == expected)
            .cloned()
    }

    /// Wait for a received line exactly equal to `expected`, appended after `since`.
    ///
    /// `cancel` resolves the wait early when it becomes `true`. With `timeout` unset
    /// the wait is unbounded.
    pub async fn wait_for(
        &self,
        expected: &str,
        since: u64,
        timeout: Option<Duration>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<LogEntry, WaitError> {
        let wait = self.wait_matching(expected, since, cancel);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| WaitError::TimedOut(limit))?,
            None => wait.await,
        }
    }

    async fn wait_matching(
        &self,
        expected: &str,
        since: u64,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<LogEntry, WaitError> {
        let mut rx = self.latest.subscribe();
        let mut checked = since;

        loop {
            let latest = *rx.borrow_and_update();
            if let Some(hit) = self.find_received(checked, latest, expected) {
                return Ok(hit);
            }
            checked = latest;

            match cancel.as_mut() {
                Some(cancel_rx) => {
                    if *cancel_rx.borrow_and_update() {
                        return Err(WaitError::Cancelled);
                    }
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Err(WaitError::Cancelled);
                            }
                        }
                        changed = cancel_rx.changed() => {
                            if changed.is_err() || *cancel_rx.borrow() {
                                return Err(WaitError::Cancelled);
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        return Err(WaitError::Cancelled);
                    }
                }
            }
        }
    }
}
