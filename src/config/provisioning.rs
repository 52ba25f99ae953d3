// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Provisioning sequence configuration
//!
//! Timing of the discovery, reboot and verification phases, and the policy
//! deciding when a read serial number is handed to the persistence sink.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When the serial number of a device is recorded in the work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Record the serial only once the device answered at its new address.
    #[default]
    AfterVerify,
    /// Record the serial as soon as it was read at the probe address, before
    /// the device is reconfigured.
    AfterRead,
}

impl fmt::Display for PersistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistPolicy::AfterVerify => write!(f, "after_verify"),
            PersistPolicy::AfterRead => write!(f, "after_read"),
        }
    }
}

impl FromStr for PersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "after_verify" => Ok(PersistPolicy::AfterVerify),
            "after_read" => Ok(PersistPolicy::AfterRead),
            other => Err(format!(
                "unknown persist policy '{}' (expected after_verify or after_read)",
                other
            )),
        }
    }
}

/// Configuration of the provisioning sequencer.
///
/// All delays are expressed in milliseconds in the YAML file.
///
/// # Example
///
/// ```
/// use rust_sensor_provisioning::config::{PersistPolicy, ProvisioningConfig};
///
/// let config = ProvisioningConfig::default();
/// assert_eq!(config.probe_address, 1);
/// assert_eq!(config.persist_policy, PersistPolicy::AfterVerify);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Bus address factory-default modules answer on.
    pub probe_address: u8,

    /// Interval between two reads at the probe address while waiting for a
    /// new module.
    pub discovery_poll_ms: u64,

    /// Pause after the reboot command before the module is probed at its new
    /// address.
    pub boot_settle_ms: u64,

    /// Interval between two liveness probes during verification.
    pub verify_poll_ms: u64,

    /// Upper bound of the verification phase.
    pub verify_timeout_ms: u64,

    /// When the serial number is recorded.
    pub persist_policy: PersistPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            probe_address: 1,
            discovery_poll_ms: 1000,
            boot_settle_ms: 500,
            verify_poll_ms: 200,
            verify_timeout_ms: 2000,
            persist_policy: PersistPolicy::AfterVerify,
        }
    }
}

impl ProvisioningConfig {
    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_ms)
    }

    pub fn boot_settle(&self) -> Duration {
        Duration::from_millis(self.boot_settle_ms)
    }

    pub fn verify_poll(&self) -> Duration {
        Duration::from_millis(self.verify_poll_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}
