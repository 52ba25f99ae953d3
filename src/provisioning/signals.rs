// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Operator cancellation signals
//!
//! Two independent flags shared between the provisioning worker and whoever
//! controls it. `stop` aborts the whole run and stays set until [`reset`].
//! `skip` abandons the device currently being handled and is cleared by the
//! worker the moment it is observed.
//!
//! [`reset`]: CancellationSignals::reset

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable handle over the stop and skip flags.
///
/// Every clone observes and drives the same pair of flags.
///
/// ```
/// use rust_sensor_provisioning::provisioning::CancellationSignals;
///
/// let signals = CancellationSignals::new();
/// let operator = signals.clone();
///
/// operator.request_skip();
/// assert!(signals.take_skip());
/// assert!(!signals.take_skip());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationSignals {
    stop: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
}

impl CancellationSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to terminate the run at its next checkpoint.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Ask the worker to abandon the current device.
    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Consume a pending skip request.
    ///
    /// Returns `true` at most once per [`request_skip`](Self::request_skip).
    pub fn take_skip(&self) -> bool {
        self.skip.swap(false, Ordering::SeqCst)
    }

    /// Clear both flags before a new run.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.skip.store(false, Ordering::SeqCst);
    }
}
