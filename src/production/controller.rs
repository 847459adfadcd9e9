//! Production run controller.
//!
//! Drives one labeling run at a time against an injected [`DeviceSession`]:
//!
//! ```text
//! request_start → submit_target → execute ──┬─> print initial batch (≤ 20)
//!                                           ├─> send start, wait batch-ready
//!                                           └─> per unit: send advance,
//!                                               wait unit-ack, print
//! stop (operator / emergency / target reached)
//!   → emergency stop command → settle → finalize (exactly once) → Saved
//! dismiss → Idle
//! ```
//!
//! # Signal correlation
//!
//! Each wait records the transcript cursor *before* the command is sent and only
//! accepts received lines appended after it, compared by exact equality.
//!
//! # Single flight
//!
//! `stop` and `finalize` are each guarded by an atomic flag checked and set in
//! one step, so an operator stop racing the automatic completion stop produces
//! one emergency stop command and one persisted record.
//!
//! Cancellation is cooperative: a stop raises a watch flag that the production
//! loop checks between steps and that ends any pending signal wait. An issued
//! command or an in-progress print is never interrupted.

use super::order::{Operator, ProductionOrder};
use super::protocol::DeviceProtocol;
use super::record::RunRecord;
use super::state::{ProductionRun, RunPhase, RunSnapshot, StopReason};
use crate::config::ProductionConfig;
use crate::device::{DeviceSession, WaitError};
use crate::error::{AppResult, ProdlineError, ValidationError};
use crate::printing::{Label, LabelPrinter};
use crate::storage::{RunStore, StoredRun};
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Run pacing and wire vocabulary.
#[derive(Debug, Clone)]
pub struct ProductionSettings {
    /// Labels printed before the device handshake
    pub initial_batch_size: u32,
    /// Pause between the emergency stop command and finalization
    pub stop_settle: Duration,
    /// Bound on each signal wait; `None` waits indefinitely
    pub signal_timeout: Option<Duration>,
    /// Device commands and signals
    pub protocol: DeviceProtocol,
}

impl Default for ProductionSettings {
    fn default() -> Self {
        ProductionSettings::from(&ProductionConfig::default())
    }
}

impl From<&ProductionConfig> for ProductionSettings {
    fn from(config: &ProductionConfig) -> Self {
        Self {
            initial_batch_size: config.initial_batch_size,
            stop_settle: config.stop_settle,
            signal_timeout: config.signal_timeout,
            protocol: config.protocol.clone(),
        }
    }
}

/// How `execute` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Target reached and the run was saved by this call
    Finished(StoredRun),
    /// A stop was requested; the stopping caller finalizes
    Stopped,
}

/// What a `stop` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call stopped and saved the run
    Saved(StoredRun),
    /// Another stop or finalize already owns the run
    AlreadyStopping,
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    order: Option<ProductionOrder>,
    run: Option<ProductionRun>,
    stop_reason: Option<StopReason>,
    last_saved: Option<StoredRun>,
    last_error: Option<String>,
    /// The device acknowledged a unit whose label is not printed yet
    unit_acknowledged: bool,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            order: None,
            run: None,
            stop_reason: None,
            last_saved: None,
            last_error: None,
            unit_acknowledged: false,
        }
    }
}

struct ControllerInner {
    session: DeviceSession,
    printer: Arc<dyn LabelPrinter>,
    store: Arc<dyn RunStore>,
    operator: Operator,
    settings: ProductionSettings,
    state: Mutex<RunState>,
    stop_tx: watch::Sender<bool>,
    executing: AtomicBool,
    stopping: AtomicBool,
    finalizing: AtomicBool,
}

/// Resets the `executing` flag when `execute` returns or is dropped.
struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Labeling run state machine, shared by cloning.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<ControllerInner>,
}

impl RunController {
    /// Create an idle controller.
    pub fn new(
        session: DeviceSession,
        printer: Arc<dyn LabelPrinter>,
        store: Arc<dyn RunStore>,
        operator: Operator,
        settings: ProductionSettings,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControllerInner {
                session,
                printer,
                store,
                operator,
                settings,
                state: Mutex::new(RunState::default()),
                stop_tx,
                executing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                finalizing: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        // Every mutation leaves RunState consistent before releasing the lock.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The device session this controller drives.
    pub fn session(&self) -> &DeviceSession {
        &self.inner.session
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    /// The most recently saved run, until dismissed.
    pub fn last_saved(&self) -> Option<StoredRun> {
        self.lock().last_saved.clone()
    }

    /// Point-in-time view for presentation.
    pub fn snapshot(&self) -> RunSnapshot {
        let st = self.lock();
        let run = st.run.as_ref();
        RunSnapshot {
            phase: st.phase,
            target: run.map_or(0, |r| r.target()),
            printed: run.map_or(0, |r| r.printed()),
            serial_count: run.map_or(0, |r| r.serials().len()),
            started_at: run.map(|r| r.started_at()),
            stop_reason: st.stop_reason,
            last_error: st.last_error.clone(),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    fn surface(&self, err: ProdlineError) -> ProdlineError {
        error!("{}", err);
        self.lock().last_error = Some(err.to_string());
        err
    }

    fn transition(&self, from: RunPhase, to: RunPhase) -> bool {
        let mut st = self.lock();
        if st.phase != from {
            return false;
        }
        st.phase = to;
        info!(%from, %to, "Run phase changed");
        true
    }

    /// Idle → AwaitingTarget.
    ///
    /// Requires a selected, complete order and a connected device.
    pub fn request_start(&self, order: Option<ProductionOrder>) -> AppResult<()> {
        let mut st = self.lock();
        if !st.phase.can_begin() {
            return Err(ProdlineError::InvalidState {
                operation: "start a run",
                phase: st.phase,
            });
        }

        let order = order.ok_or(ValidationError::NoOrderSelected)?;
        let missing = order.missing_fields();
        if !missing.is_empty() {
            return Err(ValidationError::IncompleteOrder(missing).into());
        }
        if !self.inner.session.is_connected() {
            return Err(ValidationError::DeviceNotConnected.into());
        }

        info!(batch = %order.batch, material = %order.material, "Run requested");
        st.order = Some(order);
        st.phase = RunPhase::AwaitingTarget;
        st.last_error = None;
        Ok(())
    }

    /// AwaitingTarget → Idle, discarding the selected order.
    pub fn cancel(&self) -> AppResult<()> {
        let mut st = self.lock();
        if st.phase != RunPhase::AwaitingTarget {
            return Err(ProdlineError::InvalidState {
                operation: "cancel",
                phase: st.phase,
            });
        }
        st.order = None;
        st.phase = RunPhase::Idle;
        Ok(())
    }

    /// AwaitingTarget → PrintingInitialBatch.
    ///
    /// `input` must parse as a positive integer. The run start time is captured
    /// here, once.
    pub fn submit_target(&self, input: &str) -> AppResult<u32> {
        let mut st = self.lock();
        if st.phase != RunPhase::AwaitingTarget {
            return Err(ProdlineError::InvalidState {
                operation: "set a target",
                phase: st.phase,
            });
        }

        let target = parse_target(input)?;
        let batch = st
            .order
            .as_ref()
            .map(|o| o.batch.clone())
            .ok_or(ValidationError::NoOrderSelected)?;

        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.finalizing.store(false, Ordering::SeqCst);
        self.inner.stop_tx.send_replace(false);

        st.run = Some(ProductionRun::new(target, batch, Local::now()));
        st.stop_reason = None;
        st.last_error = None;
        st.unit_acknowledged = false;
        st.phase = RunPhase::PrintingInitialBatch;
        info!(target, "Run started");
        Ok(target)
    }

    /// Drive the run from its current phase until it completes or is stopped.
    ///
    /// A print or device failure leaves the run where it is; calling `execute`
    /// again resumes from that phase.
    pub async fn execute(&self) -> AppResult<RunOutcome> {
        if self
            .inner
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProdlineError::InvalidState {
                operation: "execute twice",
                phase: self.phase(),
            });
        }
        let _guard = ExecutingGuard(&self.inner.executing);

        let protocol = self.inner.settings.protocol.clone();
        loop {
            if self.stop_requested() {
                return Ok(RunOutcome::Stopped);
            }

            let (phase, printed, target, acknowledged) = {
                let st = self.lock();
                let (printed, target) = st
                    .run
                    .as_ref()
                    .map_or((0, 0), |r| (r.printed(), r.target()));
                (st.phase, printed, target, st.unit_acknowledged)
            };

            match phase {
                RunPhase::PrintingInitialBatch => {
                    let initial = target.min(self.inner.settings.initial_batch_size);
                    if printed < initial {
                        self.print_next().await?;
                    } else if printed >= target {
                        return self.complete().await;
                    } else {
                        self.transition(phase, RunPhase::AwaitingDeviceReady);
                    }
                }
                RunPhase::AwaitingDeviceReady => {
                    if self.command_and_wait(&protocol.start, &protocol.batch_ready).await? {
                        self.transition(phase, RunPhase::Producing);
                    }
                }
                RunPhase::Producing => {
                    if printed >= target {
                        return self.complete().await;
                    }
                    // A unit acknowledged before a failed print is printed without re-advancing.
                    if !acknowledged {
                        if !self.command_and_wait(&protocol.advance, &protocol.unit_ack).await? {
                            continue;
                        }
                        self.lock().unit_acknowledged = true;
                    }
                    if self.stop_requested() {
                        continue;
                    }
                    self.print_next().await?;
                    self.lock().unit_acknowledged = false;
                }
                RunPhase::Stopping | RunPhase::Saved => return Ok(RunOutcome::Stopped),
                RunPhase::Idle | RunPhase::AwaitingTarget => {
                    return Err(ProdlineError::InvalidState {
                        operation: "execute a run",
                        phase,
                    })
                }
            }
        }
    }

    async fn complete(&self) -> AppResult<RunOutcome> {
        match self.stop(StopReason::Completed).await? {
            StopOutcome::Saved(stored) => Ok(RunOutcome::Finished(stored)),
            StopOutcome::AlreadyStopping => Ok(RunOutcome::Stopped),
        }
    }

    /// Send `command`, then wait for `signal` appended after the send began.
    ///
    /// Returns `Ok(false)` when the wait was ended by a stop request.
    async fn command_and_wait(&self, command: &str, signal: &str) -> AppResult<bool> {
        let since = self.inner.session.log().cursor();

        match self.inner.session.send(command).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.surface(ProdlineError::DeviceIo(format!(
                    "device not connected, command '{command}' not sent"
                ))))
            }
            Err(e) => return Err(self.surface(e)),
        }

        debug!(command, signal, since, "Waiting for device signal");
        match self
            .inner
            .session
            .wait_for_signal(
                signal,
                since,
                self.inner.settings.signal_timeout,
                Some(self.inner.stop_tx.subscribe()),
            )
            .await
        {
            Ok(entry) => {
                debug!(signal, seq = entry.seq, "Device signal received");
                Ok(true)
            }
            Err(WaitError::Cancelled) => Ok(false),
            Err(WaitError::TimedOut(waited)) => Err(self.surface(ProdlineError::SignalTimeout {
                signal: signal.to_string(),
                waited,
            })),
        }
    }

    /// Print the next label and count it once the printer confirms.
    async fn print_next(&self) -> AppResult<()> {
        let (serial, order) = {
            let st = self.lock();
            let run = st.run.as_ref().ok_or(ValidationError::NoActiveRun)?;
            let order = st.order.clone().ok_or(ValidationError::NoOrderSelected)?;
            match run.next_serial() {
                Some(serial) => (serial, order),
                None => return Ok(()),
            }
        };

        let label = Label::for_unit(&order, &serial, Local::now());
        if let Err(e) = self.inner.printer.print(&label).await {
            return Err(self.surface(ProdlineError::Print(format!(
                "label {serial} failed: {e:#}"
            ))));
        }

        // Checked under the lock so a finalize never builds its record between
        // the check and the count.
        let mut st = self.lock();
        if self.inner.finalizing.load(Ordering::SeqCst) {
            warn!(%serial, "Label printed after the run was finalized, not counted");
            return Ok(());
        }
        match st.run.as_mut() {
            Some(run) => {
                if run.record_print(serial.clone()) {
                    info!(%serial, printed = run.printed(), target = run.target(), "Label printed");
                } else {
                    warn!(%serial, "Label printed without an open slot in the run");
                }
            }
            None => warn!(%serial, "Label printed without an active run"),
        }
        Ok(())
    }

    /// Stop the active run: emergency stop command, settle, finalize.
    ///
    /// Only the first of several concurrent calls does anything; later calls
    /// return [`StopOutcome::AlreadyStopping`].
    pub async fn stop(&self, reason: StopReason) -> AppResult<StopOutcome> {
        if self
            .inner
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%reason, "Stop already in progress");
            return Ok(StopOutcome::AlreadyStopping);
        }

        {
            let mut st = self.lock();
            if !st.phase.is_active() {
                self.inner.stopping.store(false, Ordering::SeqCst);
                return Err(ValidationError::NoActiveRun.into());
            }
            st.phase = RunPhase::Stopping;
            st.stop_reason = Some(reason);
        }
        self.inner.stop_tx.send_replace(true);
        info!(%reason, "Stopping run");

        let protocol = &self.inner.settings.protocol;
        match self.inner.session.send(&protocol.emergency_stop).await {
            Ok(true) => {}
            Ok(false) => warn!("Emergency stop not delivered: device not connected"),
            Err(e) => warn!("Emergency stop not delivered: {}", e),
        }
        tokio::time::sleep(self.inner.settings.stop_settle).await;

        match self.finalize().await? {
            Some(stored) => Ok(StopOutcome::Saved(stored)),
            None => Ok(StopOutcome::AlreadyStopping),
        }
    }

    /// Stopping → Saved: persist the run exactly once.
    ///
    /// Returns `Ok(None)` when another finalize is in flight or already succeeded.
    /// On a store failure the counters are kept and finalize may be called again.
    pub async fn finalize(&self) -> AppResult<Option<StoredRun>> {
        if self
            .inner
            .finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Finalize already in flight");
            return Ok(None);
        }

        let record = {
            let st = self.lock();
            let built = match (st.phase, st.run.as_ref(), st.order.as_ref()) {
                (RunPhase::Stopping, Some(run), Some(order)) => Ok(RunRecord::from_run(
                    run,
                    order,
                    &self.inner.operator,
                    st.stop_reason.unwrap_or(StopReason::Operator),
                    Local::now(),
                )),
                (RunPhase::Stopping, _, _) => Err(ValidationError::NoActiveRun.into()),
                (phase, _, _) => Err(ProdlineError::InvalidState {
                    operation: "finalize",
                    phase,
                }),
            };
            match built {
                Ok(record) => record,
                Err(e) => {
                    self.inner.finalizing.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        };

        let produced = record.total_produced;
        match self.inner.store.save(record).await {
            Ok(stored) => {
                let mut st = self.lock();
                st.run = None;
                st.phase = RunPhase::Saved;
                st.last_error = None;
                st.last_saved = Some(stored.clone());
                info!(id = %stored.id, produced, "Run finalized");
                Ok(Some(stored))
            }
            Err(e) => {
                self.inner.finalizing.store(false, Ordering::SeqCst);
                Err(self.surface(ProdlineError::Persistence(format!("{e:#}"))))
            }
        }
    }

    /// Persist a run that a stop left unsaved, retrying failed saves.
    ///
    /// Makes up to `attempts` finalize calls, `delay` apart. A call that finds
    /// another finalize in flight counts as an attempt and waits for it.
    pub async fn retry_save(&self, attempts: usize, delay: Duration) -> AppResult<StoredRun> {
        let mut attempt = 1;
        loop {
            let failure = match self.finalize().await {
                Ok(Some(stored)) => return Ok(stored),
                Ok(None) => match self.last_saved() {
                    Some(stored) => return Ok(stored),
                    None => ProdlineError::InvalidState {
                        operation: "save while another save is in flight",
                        phase: self.phase(),
                    },
                },
                Err(e @ ProdlineError::Persistence(_)) => e,
                Err(e) => return Err(e),
            };

            if attempt >= attempts {
                return Err(failure);
            }
            warn!(attempt, attempts, "Run not saved yet: {}", failure);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Saved → Idle: clear the summary and reset every counter and flag.
    pub fn dismiss(&self) -> AppResult<()> {
        let mut st = self.lock();
        if st.phase != RunPhase::Saved {
            return Err(ProdlineError::InvalidState {
                operation: "dismiss",
                phase: st.phase,
            });
        }
        *st = RunState::default();
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.finalizing.store(false, Ordering::SeqCst);
        self.inner.stop_tx.send_replace(false);
        Ok(())
    }
}

/// Parse operator input as a positive target count.
pub fn parse_target(input: &str) -> Result<u32, ValidationError> {
    let trimmed = input.trim();
    match trimmed.parse::<i64>() {
        Ok(n) if n > 0 => u32::try_from(n).map_err(|_| ValidationError::InvalidTarget(trimmed.into())),
        _ => Err(ValidationError::InvalidTarget(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SessionConfig;
    use crate::hardware::mock::{MockChooser, MockDevice};
    use crate::printing::MemoryPrinter;
    use crate::storage::MemoryRunStore;

    async fn started(target: &str) -> (RunController, Arc<MemoryPrinter>) {
        let session = DeviceSession::new(
            Arc::new(MockChooser::granting(MockDevice::new())),
            SessionConfig::default(),
        );
        session.request_access().await.unwrap();
        session.connect().await.unwrap();

        let printer = Arc::new(MemoryPrinter::new());
        let controller = RunController::new(
            session,
            printer.clone(),
            Arc::new(MemoryRunStore::new()),
            Operator::new("1", "op"),
            ProductionSettings::default(),
        );
        let order = ProductionOrder {
            material: "M".into(),
            batch: "B".into(),
            description: "D".into(),
            ..Default::default()
        };
        controller.request_start(Some(order)).unwrap();
        controller.submit_target(target).unwrap();
        (controller, printer)
    }

    #[tokio::test]
    async fn test_print_next_counts_until_target() {
        let (controller, printer) = started("2").await;

        controller.print_next().await.unwrap();
        controller.print_next().await.unwrap();
        controller.print_next().await.unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.printed, 2);
        assert_eq!(snapshot.serial_count, 2);
        assert_eq!(printer.printed(), 2);
    }

    #[tokio::test]
    async fn test_print_after_finalize_began_is_not_counted() {
        let (controller, printer) = started("5").await;
        controller.print_next().await.unwrap();

        controller.inner.finalizing.store(true, Ordering::SeqCst);
        controller.print_next().await.unwrap();

        assert_eq!(printer.printed(), 2);
        assert_eq!(controller.snapshot().printed, 1);
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("25"), Ok(25));
        assert_eq!(parse_target("  7\n"), Ok(7));
        assert!(parse_target("0").is_err());
        assert!(parse_target("-3").is_err());
        assert!(parse_target("ten").is_err());
        assert!(parse_target("2.5").is_err());
        assert!(parse_target("").is_err());
        assert!(parse_target("99999999999").is_err());
    }
}
