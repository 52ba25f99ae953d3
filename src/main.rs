// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the gas-sensor provisioning tool

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use rust_sensor_provisioning::config::{self, Config, PersistPolicy};
use rust_sensor_provisioning::console::{format_summary, ConsoleObserver};
use rust_sensor_provisioning::daemon::Daemon;
use rust_sensor_provisioning::modbus::drivers::{RtuOpener, SimulatedBus, SimulatedOpener};
use rust_sensor_provisioning::modbus::ModbusTransport;
use rust_sensor_provisioning::provisioning::{
    CancellationSignals, ProvisioningSequencer, RowRef, SequencerTiming,
};
use rust_sensor_provisioning::work_order::{self, CsvSerialSink, WorkOrder};

/// First serial number handed out to simulated modules
const SIMULATED_SERIAL_BASE: u16 = 10001;

/// Assign bus addresses to factory-default gas-sensor modules over Modbus RTU
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device path or COM port name
    #[arg(long)]
    port: Option<String>,

    /// Line speed in baud
    #[arg(long)]
    baud: Option<u32>,

    /// Work order (CSV export of the plant sensor list)
    #[arg(long, conflicts_with = "plant")]
    work_order: Option<PathBuf>,

    /// Plant number, the work order is looked up on the project share
    #[arg(long)]
    plant: Option<String>,

    /// Work-order row to leave out of the run (repeatable)
    #[arg(long = "skip-row", value_name = "ROW")]
    skip_rows: Vec<u32>,

    /// When serial numbers are recorded: after_verify or after_read
    #[arg(long)]
    persist_policy: Option<PersistPolicy>,

    /// Pause after the reboot command, in milliseconds
    #[arg(long)]
    boot_settle_ms: Option<u64>,

    /// Upper bound of the verification phase, in milliseconds
    #[arg(long)]
    verify_timeout_ms: Option<u64>,

    /// Run against a simulated bus fed with N factory-default modules
    #[arg(long, value_name = "N")]
    simulate: Option<u16>,

    /// Path to a configuration to validate and exit
    #[arg(long)]
    validate_config: Option<PathBuf>,

    /// Output the configuration schema as JSON and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        return config::output_config_schema();
    }

    if let Some(validate_path) = &args.validate_config {
        if !validate_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                validate_path.display()
            ));
        }

        Config::from_file(validate_path)
            .map_err(|err| anyhow::anyhow!("Configuration validation failed: {}", err))?;
        println!("Configuration file is valid: {}", validate_path.display());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the tokio runtime")?;
    let result = runtime.block_on(run(args));

    // The operator input listener may still be parked in a blocking stdin
    // read, which would keep a plain runtime drop waiting for a keystroke.
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;

    config.apply_args(
        args.port.clone(),
        args.baud,
        args.persist_policy,
        args.boot_settle_ms,
        args.verify_timeout_ms,
    );
    config::validate_specific_rules(&config)?;

    let work_order_path = match (&args.work_order, &args.plant) {
        (Some(path), _) => path.clone(),
        (None, Some(plant)) => work_order::locate_work_order(&config, plant)?,
        (None, None) => anyhow::bail!("Either --work-order or --plant is required"),
    };
    let work_order = WorkOrder::load(&work_order_path)
        .with_context(|| format!("Failed to load work order {}", work_order_path.display()))?;

    let skip_rows: Vec<RowRef> = args.skip_rows.iter().copied().map(RowRef).collect();
    let tasks = work_order.tasks(&skip_rows)?;
    if tasks.is_empty() {
        warn!("No row with an address in {}", work_order_path.display());
        return Ok(());
    }
    info!(
        "Loaded {} task(s) from {}",
        tasks.len(),
        work_order_path.display()
    );

    let (transport, port) = match args.simulate {
        Some(count) => {
            let bus = SimulatedBus::new();
            bus.queue_factory_units((0..count).map(|i| SIMULATED_SERIAL_BASE.wrapping_add(i)));
            info!("Simulating {} factory-default module(s)", count);
            (
                ModbusTransport::new(SimulatedOpener::new(bus), config.serial.clone()),
                "simulated".to_string(),
            )
        }
        None => {
            let port = config
                .serial
                .port
                .clone()
                .context("No serial port configured, use --port or serial.port")?;
            (
                ModbusTransport::new(RtuOpener, config.serial.clone()),
                port,
            )
        }
    };

    if !transport.connect(&port).await {
        transport.close().await;
        anyhow::bail!("Could not open serial port {}", port);
    }
    info!("Connected to {} at {} baud", port, config.serial.baud_rate);

    let sink = Arc::new(CsvSerialSink::new(&work_order_path, work_order));
    let sequencer = ProvisioningSequencer::new(transport.clone(), Arc::new(ConsoleObserver), sink.clone())
        .with_timing(SequencerTiming::from(&config.provisioning));

    println!("Type 's' + Enter to skip the current device, 'q' + Enter to stop.");
    let mut daemon = Daemon::new(CancellationSignals::new());
    daemon.start_worker(sequencer, tasks)?;
    let listeners = daemon
        .start_operator_input(tokio::io::BufReader::new(tokio::io::stdin()))
        .and_then(|_| daemon.start_ctrl_c_handler());
    if let Err(err) = listeners {
        // Without operator input there is no way to stop the run cleanly
        daemon.shutdown();
        if let Err(e) = daemon.join().await {
            warn!("Provisioning worker ended abnormally: {:#}", e);
        }
        transport.close().await;
        return Err(err);
    }

    let report = daemon.join().await;
    transport.close().await;
    let report = report?;

    let work_order = sink.snapshot()?;
    println!("{}", format_summary(&report, Some(&work_order)));
    Ok(())
}
