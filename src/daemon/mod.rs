// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! Runs a provisioning batch in the background while the operator keeps
//! control over it.
//!
//! ## Components
//!
//! * **Launch Daemon**: starts the provisioning worker, the operator input
//!   listener and the Ctrl+C handler, and joins them at the end of the run
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_sensor_provisioning::daemon::Daemon;
//! use rust_sensor_provisioning::provisioning::{CancellationSignals, ProvisioningSequencer};
//! # use rust_sensor_provisioning::provisioning::{NullObserver, SerialSink, RowRef};
//! # struct Discard;
//! # impl SerialSink for Discard {
//! #     fn persist(&self, _: &RowRef, _: u16) -> anyhow::Result<()> { Ok(()) }
//! # }
//!
//! async fn run(
//!     transport: Arc<rust_sensor_provisioning::modbus::ModbusTransport>,
//!     tasks: Vec<rust_sensor_provisioning::provisioning::ProvisioningTask>,
//! ) -> anyhow::Result<()> {
//!     let sequencer = ProvisioningSequencer::new(transport, Arc::new(NullObserver), Arc::new(Discard));
//!
//!     let mut daemon = Daemon::new(CancellationSignals::new());
//!     daemon.start_worker(sequencer, tasks)?;
//!     daemon.start_operator_input(tokio::io::BufReader::new(tokio::io::stdin()))?;
//!     daemon.start_ctrl_c_handler()?;
//!
//!     let report = daemon.join().await?;
//!     println!("{} device(s) provisioned", report.succeeded());
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;

pub use launch_daemon::{Daemon, OperatorCommand};
