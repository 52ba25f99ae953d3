// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the sensor provisioning tool
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings. The configuration is backed by a YAML file and
//! validated against a JSON schema before it is deserialized.
//!
//! ## Configuration Structure
//!
//! - `serial`: the RS-485 line and the transport retry policy
//! - `provisioning`: timing of the provisioning sequence and persist policy
//! - `work_order`: where plant work orders are looked up
//!
//! ## Usage
//!
//! ```no_run
//! use rust_sensor_provisioning::config::Config;
//! use std::path::Path;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file(Path::new("config.yaml")).unwrap();
//!
//! // Apply command line overrides if needed
//! config.apply_args(
//!     Some("/dev/ttyUSB0".to_string()), // Serial port
//!     Some(19200),                      // Baud rate
//!     None,                             // Persist policy
//!     None,                             // Boot settle delay
//!     Some(3000),                       // Verification timeout
//! );
//!
//! println!("Serial port: {:?}", config.serial.port);
//! ```

pub mod provisioning;
pub mod serial;
pub mod utils;
pub mod work_order;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use provisioning::{PersistPolicy, ProvisioningConfig};
pub use serial::{SerialConfig, STANDARD_BAUD_RATES};
pub use utils::{output_config_schema, validate_specific_rules};
pub use work_order::{WorkOrderConfig, DEFAULT_PATH_TEMPLATE};

/// Root configuration structure of the provisioning tool.
///
/// Every section falls back to its defaults when missing from the file, so an
/// empty YAML document is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Serial line settings.
    #[serde(default)]
    pub serial: SerialConfig,

    /// Provisioning sequence timing and persist policy.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Work-order lookup.
    #[serde(default)]
    pub work_order: WorkOrderConfig,
}

impl Config {
    /// Write a `<name>.sample.yaml` with default values next to an invalid
    /// configuration file.
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Creating sample configuration file at {:?}", sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Validate a YAML document against the embedded JSON schema.
    fn validate_against_schema(contents: &str, origin: &Path) -> Result<()> {
        if contents.trim().is_empty() {
            return Ok(());
        }
        let yaml_value: serde_yml::Value = serde_yml::from_str(contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", origin))?;

        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", origin)
        })?;

        let schema_str = include_str!("../../resources/config.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating {} configuration against schema", origin.display());
        if let Err(error) = validator.validate(&json_value) {
            anyhow::bail!("Configuration validation failed: {}", error);
        }
        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// A missing file is created with default values. A file that fails
    /// validation leaves a `<name>.sample.yaml` next to it and returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        if let Err(err) = Self::validate_against_schema(&contents, path) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            return Err(err);
        }

        debug!("Schema validation passed, deserializing into Config structure");
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            match serde_yml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    error!("Configuration deserialization error: {}", err);
                    if let Err(e) = Self::create_sample_config(path) {
                        error!("Failed to create sample config: {}", e);
                    }
                    return Err(anyhow::anyhow!(
                        "Failed to deserialize configuration from {}: {}",
                        path.display(),
                        err
                    ));
                }
            }
        };

        if let Err(err) = validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// Only the values actually provided on the command line replace the ones
    /// loaded from the file.
    ///
    /// # Parameters
    ///
    /// * `port` - Serial device path or COM port name
    /// * `baud_rate` - Line speed
    /// * `persist_policy` - When serial numbers are recorded
    /// * `boot_settle_ms` - Pause after the reboot command
    /// * `verify_timeout_ms` - Upper bound of the verification phase
    pub fn apply_args(
        &mut self,
        port: Option<String>,
        baud_rate: Option<u32>,
        persist_policy: Option<PersistPolicy>,
        boot_settle_ms: Option<u64>,
        verify_timeout_ms: Option<u64>,
    ) {
        if let Some(port) = port {
            debug!("Overriding serial port from command line: {}", port);
            self.serial.port = Some(port);
        }
        if let Some(baud_rate) = baud_rate {
            debug!("Overriding baud rate from command line: {}", baud_rate);
            self.serial.baud_rate = baud_rate;
        }
        if let Some(policy) = persist_policy {
            debug!("Overriding persist policy from command line: {}", policy);
            self.provisioning.persist_policy = policy;
        }
        if let Some(settle) = boot_settle_ms {
            debug!("Overriding boot settle delay from command line: {} ms", settle);
            self.provisioning.boot_settle_ms = settle;
        }
        if let Some(timeout) = verify_timeout_ms {
            debug!(
                "Overriding verification timeout from command line: {} ms",
                timeout
            );
            self.provisioning.verify_timeout_ms = timeout;
        }
    }
}
