// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serial line configuration
//!
//! This module defines the settings of the RS-485 line the sensor modules are
//! attached to. Framing is fixed to 8N1 RTU and is therefore not configurable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Line speeds accepted for the RS-485 bus.
pub const STANDARD_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Configuration of the serial line and of the transport retry policy.
///
/// # Example
///
/// ```
/// use rust_sensor_provisioning::config::SerialConfig;
///
/// let serial = SerialConfig {
///     port: Some("/dev/ttyUSB0".to_string()),
///     ..SerialConfig::default()
/// };
/// assert_eq!(serial.baud_rate, 9600);
/// assert_eq!(serial.timeout().as_millis(), 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path (`/dev/ttyUSB0`) or COM port name (`COM3`).
    ///
    /// When unset the port must be given on the command line.
    pub port: Option<String>,

    /// Line speed in baud. Factory-default modules talk at 9600.
    pub baud_rate: u32,

    /// Maximum time to wait for the answer to a single register operation.
    pub timeout_ms: u64,

    /// Pause between a failed register operation and its single retry.
    pub retry_backoff_ms: u64,

    /// Cadence of the background reconnect watchdog.
    pub watchdog_interval_secs: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            timeout_ms: 1000,
            retry_backoff_ms: 200,
            watchdog_interval_secs: 5,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}
