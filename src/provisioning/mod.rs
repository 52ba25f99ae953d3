// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Per-device provisioning
//!
//! This module drives factory-default gas-sensor modules, one at a time,
//! through discovery at the probe address, configuration, reboot and
//! verification at their new address.
//!
//! ## Key Components
//!
//! - [`ProvisioningSequencer`]: the cancellable state machine running a batch of tasks.
//! - [`CancellationSignals`]: operator stop/skip flags read at every suspension point.
//! - [`SeenSerialRegistry`]: serial numbers already configured during the current run.
//! - [`ProvisioningObserver`] and [`SerialSink`]: the outward callback surface.
//!
//! Each task ends in exactly one terminal [`TaskOutcome`], unless the run is
//! stopped before the task completes, in which case no outcome is reported
//! for it.

pub mod sequencer;
pub mod signals;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::modbus::{TransportError, MAX_DEVICE_ADDRESS, PROBE_ADDRESS};

pub use crate::config::PersistPolicy;
pub use sequencer::{ProvisioningSequencer, SequencerTiming};
pub use signals::CancellationSignals;

/// Identifies the work-order row a task comes from.
///
/// Rows are numbered like spreadsheet rows: the header is row 1 and the first
/// device is row 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef(pub u32);

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}", self.0)
    }
}

/// Rejected task data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{row}: target address {address} is outside {min}-{max}")]
    AddressOutOfRange {
        row: RowRef,
        address: u16,
        min: u8,
        max: u8,
    },
}

/// One device to provision.
///
/// Immutable once built; the sequencer only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningTask {
    row: RowRef,
    target_address: u8,
    buzzer_disable: bool,
    enabled: bool,
}

impl ProvisioningTask {
    /// Build a task, rejecting target addresses a device cannot keep.
    ///
    /// The probe address itself is excluded: a device moved there would be
    /// indistinguishable from the next factory-default unit.
    pub fn new(
        row: RowRef,
        target_address: u16,
        buzzer_disable: bool,
        enabled: bool,
    ) -> Result<Self, TaskError> {
        let min = PROBE_ADDRESS + 1;
        if target_address < u16::from(min) || target_address > u16::from(MAX_DEVICE_ADDRESS) {
            return Err(TaskError::AddressOutOfRange {
                row,
                address: target_address,
                min,
                max: MAX_DEVICE_ADDRESS,
            });
        }
        Ok(Self {
            row,
            target_address: target_address as u8,
            buzzer_disable,
            enabled,
        })
    }

    pub fn row(&self) -> RowRef {
        self.row
    }

    pub fn target_address(&self) -> u8 {
        self.target_address
    }

    pub fn buzzer_disable(&self) -> bool {
        self.buzzer_disable
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Result of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Pending,
    Skipped,
    Ok(u16),
    Fail,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Pending => write!(f, "Pending"),
            TaskOutcome::Skipped => write!(f, "Skipped"),
            TaskOutcome::Ok(serial) => write!(f, "OK (SN={})", serial),
            TaskOutcome::Fail => write!(f, "Fail"),
        }
    }
}

/// Configuration step of the provisioning protocol, used in failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureStep {
    ReadSerial,
    WriteAddress,
    ReadFeatureFlags,
    WriteFeatureFlags,
    Reboot,
}

impl fmt::Display for ConfigureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigureStep::ReadSerial => "read serial",
            ConfigureStep::WriteAddress => "write address",
            ConfigureStep::ReadFeatureFlags => "read feature flags",
            ConfigureStep::WriteFeatureFlags => "write feature flags",
            ConfigureStep::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// Why a task ended in [`TaskOutcome::Fail`]
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("step '{step}' failed ({kind:?}): {source}", kind = .source.kind())]
    Step {
        step: ConfigureStep,
        #[source]
        source: TransportError,
    },

    #[error("no reply at address {address} within {elapsed:?}")]
    VerificationTimeout { address: u8, elapsed: Duration },
}

impl ProvisioningError {
    pub(crate) fn step(step: ConfigureStep) -> impl FnOnce(TransportError) -> Self {
        move |source| ProvisioningError::Step { step, source }
    }
}

/// Serial numbers configured during the current run.
#[derive(Debug, Clone, Default)]
pub struct SeenSerialRegistry {
    serials: HashSet<u16>,
}

impl SeenSerialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a serial; returns `false` if it was already present.
    pub fn insert(&mut self, serial: u16) -> bool {
        self.serials.insert(serial)
    }

    pub fn contains(&self, serial: u16) -> bool {
        self.serials.contains(&serial)
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

/// Receives the log feed and the task status transitions of a run.
///
/// Called from the provisioning worker; implementations must not block.
pub trait ProvisioningObserver: Send + Sync {
    /// A notable event, already prefixed with the row it concerns when any.
    fn on_log(&self, line: &str);

    /// Terminal outcome of a task, reported once per task.
    fn on_task_status(&self, row: &RowRef, outcome: &TaskOutcome);

    /// The worker started handling this row.
    fn on_task_started(&self, _row: &RowRef) {}

    /// The worker is done with this row, whatever the outcome.
    fn on_task_finished(&self, _row: &RowRef) {}
}

/// Durable record of provisioned serial numbers.
pub trait SerialSink: Send + Sync {
    /// Record `serial` against `row`. Failures are logged by the caller and
    /// never change the task outcome.
    fn persist(&self, row: &RowRef, serial: u16) -> anyhow::Result<()>;
}

/// Observer discarding everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProvisioningObserver for NullObserver {
    fn on_log(&self, _line: &str) {}
    fn on_task_status(&self, _row: &RowRef, _outcome: &TaskOutcome) {}
}

/// Summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Terminal outcomes, in task order. Tasks without an outcome are absent.
    pub outcomes: Vec<(RowRef, TaskOutcome)>,
    /// Whether the run ended on a stop request.
    pub aborted: bool,
}

impl RunReport {
    pub fn outcome(&self, row: RowRef) -> Option<TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(r, _)| *r == row)
            .map(|(_, outcome)| *outcome)
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Ok(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Fail))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Skipped))
    }

    fn count(&self, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}
