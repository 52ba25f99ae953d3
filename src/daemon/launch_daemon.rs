// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;

use crate::modbus::RegisterBus;
use crate::provisioning::{CancellationSignals, ProvisioningSequencer, ProvisioningTask, RunReport};

/// Operator command read from the control input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Skip,
    Stop,
}

impl OperatorCommand {
    /// Parse one input line; blank or unknown lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "s" | "skip" => Some(OperatorCommand::Skip),
            "q" | "quit" | "stop" => Some(OperatorCommand::Stop),
            _ => None,
        }
    }
}

/// Runs one provisioning batch on a dedicated worker task and wires the
/// operator controls to its cancellation signals.
pub struct Daemon {
    signals: CancellationSignals,
    worker: Option<JoinHandle<RunReport>>,
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
}

impl Daemon {
    /// Create a new daemon instance.
    ///
    /// Both flags of `signals` are cleared, a stop left over from a previous
    /// run would otherwise end this one immediately.
    pub fn new(signals: CancellationSignals) -> Self {
        signals.reset();
        Daemon {
            signals,
            worker: None,
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn signals(&self) -> &CancellationSignals {
        &self.signals
    }

    /// Start the provisioning worker.
    ///
    /// The worker is the only user of the bus until it finishes.
    pub fn start_worker<B>(
        &mut self,
        sequencer: ProvisioningSequencer<B>,
        tasks: Vec<ProvisioningTask>,
    ) -> Result<()>
    where
        B: RegisterBus + 'static,
    {
        if self.worker.is_some() {
            anyhow::bail!("Provisioning worker already started");
        }
        info!("Starting provisioning worker with {} task(s)", tasks.len());

        let signals = self.signals.clone();
        let running = self.running.clone();
        self.worker = Some(tokio::spawn(async move {
            let report = sequencer.run(&tasks, &signals).await;
            running.store(false, Ordering::SeqCst);
            report
        }));
        Ok(())
    }

    /// Map operator input lines onto the cancellation signals.
    ///
    /// `s`/`skip` abandons the current device, `q`/`stop` ends the run.
    pub fn start_operator_input<R>(&mut self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        debug!("Starting operator input listener");

        let signals = self.signals.clone();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            let mut lines = reader.lines();
            while running.load(Ordering::SeqCst) {
                let Some(line) = lines.next_line().await? else {
                    debug!("Operator input closed");
                    break;
                };
                match OperatorCommand::parse(&line) {
                    Some(OperatorCommand::Skip) => {
                        info!("Skip requested by operator");
                        signals.request_skip();
                    }
                    Some(OperatorCommand::Stop) => {
                        info!("Stop requested by operator");
                        signals.request_stop();
                        break;
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!("Unknown command '{}' (s = skip, q = stop)", line.trim()),
                }
            }
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Request a stop when the process receives Ctrl+C.
    pub fn start_ctrl_c_handler(&mut self) -> Result<()> {
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Ctrl+C received, stopping after the current step");
            signals.request_stop();
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Ask the worker to stop at its next checkpoint.
    pub fn shutdown(&self) {
        info!("Shutting down provisioning worker");
        self.signals.request_stop();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the worker and return its report.
    ///
    /// Auxiliary listeners are cancelled once the worker is done.
    pub async fn join(mut self) -> Result<RunReport> {
        let worker = self
            .worker
            .take()
            .context("Provisioning worker was never started")?;
        let report = worker.await.context("Provisioning worker panicked")?;

        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks {
            task.abort();
            match task.await {
                Ok(Err(e)) => warn!("Auxiliary task failed: {:#}", e),
                Err(e) if e.is_panic() => log::error!("Task panicked: {}", e),
                _ => {}
            }
        }
        Ok(report)
    }
}
