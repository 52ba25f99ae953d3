// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Provisioning state machine
//!
//! For every enabled task the sequencer waits for a device it has not seen
//! yet at the probe address, moves it to the task's target address, reboots
//! it and checks that it answers at the new address.
//!
//! ```text
//! Pending ─┬─> Skipped                      (task disabled)
//!          └─> Discovering ─┬─> Skipped     (skip)
//!                           ├─> aborted     (stop, no outcome)
//!                           └─> Configuring ─┬─> Skipped   (skip at a checkpoint)
//!                                            ├─> aborted   (stop at a checkpoint)
//!                                            ├─> Fail      (step error, verification timeout)
//!                                            └─> Ok(serial)
//! ```
//!
//! The stop and skip flags are checked before every bus operation and on
//! every poll iteration, so cancellation latency is bounded by one poll
//! interval plus one register operation.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::{self, Instant};

use super::{
    CancellationSignals, ConfigureStep, ProvisioningError, ProvisioningObserver,
    ProvisioningTask, RowRef, RunReport, SeenSerialRegistry, SerialSink, TaskOutcome,
};
use crate::config::{PersistPolicy, ProvisioningConfig};
use crate::modbus::{
    clear_buzzer_flag, RegisterBus, TransportError, TransportErrorKind, CMD_SOFT_REBOOT, REG_BUS_ADDRESS,
    REG_COMMAND, REG_FEATURE_FLAGS, REG_LIVENESS, REG_SERIAL,
};

/// Timing and policy of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerTiming {
    /// Address factory-default devices answer on
    pub probe_address: u8,
    /// Interval between reads at the probe address while waiting for a device
    pub discovery_poll: Duration,
    /// Pause after the reboot command
    pub boot_settle: Duration,
    /// Interval between liveness probes at the new address
    pub verify_poll: Duration,
    /// Upper bound of the verification phase
    pub verify_timeout: Duration,
    pub persist_policy: PersistPolicy,
}

impl From<&ProvisioningConfig> for SequencerTiming {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            probe_address: config.probe_address,
            discovery_poll: config.discovery_poll(),
            boot_settle: config.boot_settle(),
            verify_poll: config.verify_poll(),
            verify_timeout: config.verify_timeout(),
            persist_policy: config.persist_policy,
        }
    }
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self::from(&ProvisioningConfig::default())
    }
}

/// Cancellation observed at a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Skip,
    Stop,
}

/// How the handling of one task ended
enum TaskEnd {
    Outcome(TaskOutcome),
    Stopped,
}

enum Discovery {
    Found,
    Interrupted(Interrupt),
}

enum Configured {
    Done(u16),
    /// The device at the probe address turned out to be one provisioned earlier in the run
    AlreadySeen(u16),
    Interrupted(Interrupt),
}

/// Drives a batch of [`ProvisioningTask`]s over a [`RegisterBus`].
///
/// The sequencer is the only bus user while a run is active. It reports
/// everything through its [`ProvisioningObserver`] and hands serial numbers to
/// its [`SerialSink`]; [`run`](Self::run) itself never fails.
pub struct ProvisioningSequencer<B> {
    bus: B,
    timing: SequencerTiming,
    observer: Arc<dyn ProvisioningObserver>,
    sink: Arc<dyn SerialSink>,
}

impl<B: RegisterBus> ProvisioningSequencer<B> {
    pub fn new(
        bus: B,
        observer: Arc<dyn ProvisioningObserver>,
        sink: Arc<dyn SerialSink>,
    ) -> Self {
        Self {
            bus,
            timing: SequencerTiming::default(),
            observer,
            sink,
        }
    }

    pub fn with_timing(mut self, timing: SequencerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Process `tasks` in order.
    ///
    /// Returns the terminal outcome of every task handled before the run
    /// ended. A stop request ends the run at the next checkpoint; the task in
    /// progress and all later tasks get no outcome.
    pub async fn run(&self, tasks: &[ProvisioningTask], signals: &CancellationSignals) -> RunReport {
        let mut seen = SeenSerialRegistry::new();
        let mut report = RunReport::default();

        self.log(&format!("Worker started with {} task(s)", tasks.len()));

        for task in tasks {
            let row = task.row();
            if signals.is_stopped() {
                report.aborted = true;
                break;
            }

            if !task.enabled() {
                self.log(&format!("{}: deselected, skipped", row));
                self.report(&mut report, row, TaskOutcome::Skipped);
                continue;
            }

            self.observer.on_task_started(&row);
            let end = self.provision(task, signals, &mut seen).await;
            match end {
                TaskEnd::Outcome(outcome) => {
                    self.log(&format!("{}: {}", row, outcome));
                    self.report(&mut report, row, outcome);
                    self.observer.on_task_finished(&row);
                }
                TaskEnd::Stopped => {
                    self.observer.on_task_finished(&row);
                    report.aborted = true;
                    break;
                }
            }
        }

        if report.aborted {
            self.log("Stop requested, run aborted");
        }
        self.log(&format!(
            "Worker finished: {} ok, {} failed, {} skipped",
            report.succeeded(),
            report.failed(),
            report.skipped()
        ));
        report
    }

    async fn provision(
        &self,
        task: &ProvisioningTask,
        signals: &CancellationSignals,
        seen: &mut SeenSerialRegistry,
    ) -> TaskEnd {
        let row = task.row();

        if task.target_address() == self.timing.probe_address {
            self.log(&format!(
                "{}: target address {} is the probe address",
                row,
                task.target_address()
            ));
            return TaskEnd::Outcome(TaskOutcome::Fail);
        }

        loop {
            match self.wait_for_new_device(row, signals, seen).await {
                Discovery::Found => {}
                Discovery::Interrupted(interrupt) => return self.interrupted(row, interrupt),
            }

            if let Some(interrupt) = checkpoint(signals) {
                return self.interrupted(row, interrupt);
            }

            self.log(&format!(
                "{}: configuring, new address {}",
                row,
                task.target_address()
            ));
            match self.configure(task, signals, seen).await {
                Ok(Configured::Done(serial)) => {
                    if self.timing.persist_policy == PersistPolicy::AfterVerify {
                        self.persist(row, serial);
                    }
                    seen.insert(serial);
                    return TaskEnd::Outcome(TaskOutcome::Ok(serial));
                }
                Ok(Configured::AlreadySeen(serial)) => {
                    self.log(&format!(
                        "{}: SN={} was already provisioned in this run, waiting again",
                        row, serial
                    ));
                }
                Ok(Configured::Interrupted(interrupt)) => return self.interrupted(row, interrupt),
                Err(err) => {
                    self.log(&format!("{}: FAIL: {}", row, err));
                    return TaskEnd::Outcome(TaskOutcome::Fail);
                }
            }
        }
    }

    /// Poll the serial register at the probe address until a device whose
    /// serial is not in `seen` answers.
    async fn wait_for_new_device(
        &self,
        row: RowRef,
        signals: &CancellationSignals,
        seen: &SeenSerialRegistry,
    ) -> Discovery {
        let probe = self.timing.probe_address;
        self.log(&format!("{}: waiting for a new device at address {}", row, probe));

        let mut last_error: Option<TransportErrorKind> = None;
        loop {
            if let Some(interrupt) = checkpoint(signals) {
                return Discovery::Interrupted(interrupt);
            }

            match self.bus.read_holding(REG_SERIAL, probe, 1).await {
                Ok(values) => {
                    last_error = None;
                    match values.first() {
                        Some(&serial) if !seen.contains(serial) => {
                            self.log(&format!(
                                "{}: found device at address {} (SN={})",
                                row, probe, serial
                            ));
                            return Discovery::Found;
                        }
                        Some(&serial) => {
                            debug!("{}: SN={} still connected, waiting for replacement", row, serial);
                        }
                        None => debug!("{}: empty answer at address {}", row, probe),
                    }
                }
                Err(err) => {
                    // Report each new kind of error once, the bus is expected to be noisy
                    if last_error != Some(err.kind()) {
                        self.log(&format!("{}: bus error while waiting: {}", row, err));
                        last_error = Some(err.kind());
                    } else {
                        debug!("{}: bus error while waiting: {}", row, err);
                    }
                }
            }

            time::sleep(self.timing.discovery_poll).await;
        }
    }

    /// Run the configuration steps against the device at the probe address.
    async fn configure(
        &self,
        task: &ProvisioningTask,
        signals: &CancellationSignals,
        seen: &SeenSerialRegistry,
    ) -> Result<Configured, ProvisioningError> {
        let probe = self.timing.probe_address;
        let row = task.row();

        macro_rules! checkpoint {
            () => {
                if let Some(interrupt) = checkpoint(signals) {
                    return Ok(Configured::Interrupted(interrupt));
                }
            };
        }

        let values = self
            .bus
            .read_holding(REG_SERIAL, probe, 1)
            .await
            .map_err(ProvisioningError::step(ConfigureStep::ReadSerial))?;
        let serial = match values.first() {
            Some(&serial) => serial,
            None => {
                return Err(ProvisioningError::Step {
                    step: ConfigureStep::ReadSerial,
                    source: TransportError::InvalidRequest("empty answer".to_string()),
                })
            }
        };
        if seen.contains(serial) {
            return Ok(Configured::AlreadySeen(serial));
        }
        debug!("{}: SN={}", row, serial);

        if self.timing.persist_policy == PersistPolicy::AfterRead {
            self.persist(row, serial);
        }

        checkpoint!();
        self.bus
            .write_single(REG_BUS_ADDRESS, u16::from(task.target_address()), probe)
            .await
            .map_err(ProvisioningError::step(ConfigureStep::WriteAddress))?;

        if task.buzzer_disable() {
            checkpoint!();
            let values = self
                .bus
                .read_holding(REG_FEATURE_FLAGS, probe, 1)
                .await
                .map_err(ProvisioningError::step(ConfigureStep::ReadFeatureFlags))?;
            let Some(&flags) = values.first() else {
                return Err(ProvisioningError::Step {
                    step: ConfigureStep::ReadFeatureFlags,
                    source: TransportError::InvalidRequest("empty answer".to_string()),
                });
            };
            checkpoint!();
            self.bus
                .write_single(REG_FEATURE_FLAGS, clear_buzzer_flag(flags), probe)
                .await
                .map_err(ProvisioningError::step(ConfigureStep::WriteFeatureFlags))?;
            debug!("{}: buzzer disabled (flags {:#06x})", row, flags);
        }

        checkpoint!();
        self.bus
            .write_single(REG_COMMAND, CMD_SOFT_REBOOT, probe)
            .await
            .map_err(ProvisioningError::step(ConfigureStep::Reboot))?;

        time::sleep(self.timing.boot_settle).await;

        match self.verify(task.target_address(), signals).await? {
            Some(interrupt) => Ok(Configured::Interrupted(interrupt)),
            None => Ok(Configured::Done(serial)),
        }
    }

    /// Probe the liveness register at `address` until it answers or the
    /// verification window closes.
    ///
    /// A probe still pending when the window closes is abandoned, and the
    /// signals are polled every `verify_poll` while a probe is in flight.
    async fn verify(
        &self,
        address: u8,
        signals: &CancellationSignals,
    ) -> Result<Option<Interrupt>, ProvisioningError> {
        let timeout = self.timing.verify_timeout;
        let started = Instant::now();

        loop {
            if let Some(interrupt) = checkpoint(signals) {
                return Ok(Some(interrupt));
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            let probe = time::timeout(remaining, self.bus.read_holding(REG_LIVENESS, address, 1));
            let answer = tokio::select! {
                answer = probe => answer,
                interrupt = wait_for_interrupt(signals, self.timing.verify_poll) => {
                    return Ok(Some(interrupt));
                }
            };
            match answer {
                Ok(Ok(_)) => return Ok(None),
                Ok(Err(err)) => debug!("No reply at address {} yet: {}", address, err),
                Err(_) => debug!("Probe at address {} still pending after {:?}", address, remaining),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ProvisioningError::VerificationTimeout { address, elapsed });
            }
            time::sleep(self.timing.verify_poll.min(timeout - elapsed)).await;
        }
    }

    /// Translate a cancellation into the end of the current task.
    fn interrupted(&self, row: RowRef, interrupt: Interrupt) -> TaskEnd {
        match interrupt {
            Interrupt::Skip => {
                self.log(&format!("{}: skipped by operator", row));
                TaskEnd::Outcome(TaskOutcome::Skipped)
            }
            Interrupt::Stop => TaskEnd::Stopped,
        }
    }

    fn persist(&self, row: RowRef, serial: u16) {
        if let Err(err) = self.sink.persist(&row, serial) {
            self.log(&format!("{}: could not record SN={}: {:#}", row, serial, err));
        }
    }

    fn report(&self, report: &mut RunReport, row: RowRef, outcome: TaskOutcome) {
        self.observer.on_task_status(&row, &outcome);
        report.outcomes.push((row, outcome));
    }

    fn log(&self, line: &str) {
        debug!("{}", line);
        self.observer.on_log(line);
    }
}

/// Stop wins over skip; a pending skip is only consumed when no stop is pending.
fn checkpoint(signals: &CancellationSignals) -> Option<Interrupt> {
    if signals.is_stopped() {
        Some(Interrupt::Stop)
    } else if signals.take_skip() {
        Some(Interrupt::Skip)
    } else {
        None
    }
}

/// Resolves once a stop or skip is requested, checking every `poll`.
async fn wait_for_interrupt(signals: &CancellationSignals, poll: Duration) -> Interrupt {
    loop {
        if let Some(interrupt) = checkpoint(signals) {
            return interrupt;
        }
        time::sleep(poll).await;
    }
}
