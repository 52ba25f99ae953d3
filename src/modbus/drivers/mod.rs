// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Link drivers for the RS-485 bus
//!
//! This module provides the hardware abstraction below [`super::ModbusTransport`]:
//! - RTU: a real serial port driven by tokio-serial and tokio-modbus
//! - Simulated: an in-process bus populated with simulated sensor modules
//!
//! A driver is split in two parts. A [`LinkOpener`] knows how to open the line
//! and stays alive for the whole session, the [`ModbusLink`] it returns is the
//! open handle and is thrown away on the first communication failure.

pub mod rtu;
pub mod simulated;

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::ExceptionCode;

pub use rtu::RtuOpener;
pub use simulated::{SimulatedBus, SimulatedOpener, SimulatedSensor};

/// Parameters used to open a serial line.
///
/// Framing is fixed to 8 data bits, no parity and 1 stop bit; only the port,
/// the line speed and the per-call timeout are tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Serial device path (`/dev/ttyUSB0`) or COM port name (`COM3`)
    pub port: String,
    /// Line speed in baud
    pub baud_rate: u32,
    /// Maximum time to wait for a response
    pub timeout: Duration,
}

impl LinkSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }
}

/// Failure of a single register operation on an open link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("device answered with exception {0:?}")]
    Exception(ExceptionCode),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("link is closed")]
    Closed,
}

impl LinkError {
    /// Whether the failure comes from the physical line rather than from the
    /// device or from the request itself.
    ///
    /// Communication failures are the only ones worth a reconnect and retry.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_) | LinkError::Timeout(_) | LinkError::Protocol(_) | LinkError::Closed
        )
    }
}

/// An open Modbus RTU link
#[async_trait::async_trait]
pub trait ModbusLink: Send {
    /// Read `count` holding registers starting at `address` from device `unit`
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError>;

    /// Write a single holding register on device `unit`
    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError>;

    /// Whether the underlying handle is still usable
    fn is_open(&self) -> bool;

    /// Release the underlying handle
    async fn close(&mut self);
}

/// Factory for [`ModbusLink`] handles
#[async_trait::async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open the line described by `settings`
    async fn open(&self, settings: &LinkSettings) -> io::Result<Box<dyn ModbusLink>>;
}

/// Reject requests no device could answer before they reach the wire.
pub(crate) fn check_read_count(count: u16) -> Result<(), LinkError> {
    if count == 0 || count > 125 {
        return Err(LinkError::InvalidRequest(format!(
            "cannot read {} holding registers (1-125)",
            count
        )));
    }
    Ok(())
}
