// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use anyhow::{Context, Result};
use log::debug;

use super::{Config, STANDARD_BAUD_RATES};
use crate::modbus::MAX_DEVICE_ADDRESS;

/// Output the embedded JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line.
///
/// # Example
///
/// ```bash
/// ./rust_sensor_provisioning --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema_str = include_str!("../../resources/config.schema.json");

    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;

    println!("{}", formatted_schema);

    Ok(())
}

/// Validates the configuration against rules the JSON schema cannot express.
///
/// # Validation Rules
///
/// - **Baud rate**: one of [`STANDARD_BAUD_RATES`]
/// - **Timeouts**: the per-call timeout and every poll interval are non-zero
/// - **Verification window**: the verification timeout is at least one poll interval
/// - **Probe address**: a valid RTU unit id (1-247)
/// - **Path template**: contains the `{plant}` placeholder
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    if !STANDARD_BAUD_RATES.contains(&config.serial.baud_rate) {
        anyhow::bail!(
            "Unsupported baud rate {} (expected one of {:?})",
            config.serial.baud_rate,
            STANDARD_BAUD_RATES
        );
    }

    if config.serial.timeout_ms == 0 {
        anyhow::bail!("serial.timeout_ms must be greater than zero");
    }

    let provisioning = &config.provisioning;
    if provisioning.discovery_poll_ms == 0 || provisioning.verify_poll_ms == 0 {
        anyhow::bail!("Poll intervals must be greater than zero");
    }

    if provisioning.verify_timeout_ms < provisioning.verify_poll_ms {
        anyhow::bail!(
            "Verification timeout ({} ms) is shorter than the verification poll interval ({} ms)",
            provisioning.verify_timeout_ms,
            provisioning.verify_poll_ms
        );
    }

    if provisioning.probe_address == 0 || provisioning.probe_address > MAX_DEVICE_ADDRESS {
        anyhow::bail!(
            "Invalid probe address {} (1-{})",
            provisioning.probe_address,
            MAX_DEVICE_ADDRESS
        );
    }

    if !config.work_order.path_template.contains("{plant}") {
        anyhow::bail!(
            "Work-order path template '{}' does not contain {{plant}}",
            config.work_order.path_template
        );
    }

    Ok(())
}
