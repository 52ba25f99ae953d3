// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus RTU driver over a real serial port
//!
//! The port is opened with tokio-serial using the fixed 8N1 framing and a
//! tokio-modbus RTU client context is attached to it. tokio-modbus never
//! retries on its own, which keeps failure timing predictable; the single
//! retry lives one level up in the transport.

use std::io;

use log::debug;
use tokio_modbus::client::{rtu, Client, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

use super::{check_read_count, LinkError, LinkOpener, LinkSettings, ModbusLink};
use crate::modbus::PROBE_ADDRESS;

/// Opens RS-485 lines through the operating system serial driver
#[derive(Debug, Default, Clone, Copy)]
pub struct RtuOpener;

#[async_trait::async_trait]
impl LinkOpener for RtuOpener {
    async fn open(&self, settings: &LinkSettings) -> io::Result<Box<dyn ModbusLink>> {
        debug!(
            "Opening {} at {} baud (8N1, timeout {:?})",
            settings.port, settings.baud_rate, settings.timeout
        );

        let builder = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.timeout);
        let stream = SerialStream::open(&builder)?;
        let ctx = rtu::attach_slave(stream, Slave(PROBE_ADDRESS));

        Ok(Box::new(RtuLink {
            ctx,
            open: true,
            port: settings.port.clone(),
        }))
    }
}

/// Open RTU client context bound to one serial port
pub struct RtuLink {
    ctx: Context,
    open: bool,
    port: String,
}

impl RtuLink {
    /// Translate a tokio-modbus failure, marking the handle closed when the
    /// serial device itself failed.
    fn classify(&mut self, err: tokio_modbus::Error) -> LinkError {
        match err {
            tokio_modbus::Error::Transport(io_err) => {
                debug!("Serial transport failure on {}: {}", self.port, io_err);
                self.open = false;
                LinkError::Io(io_err)
            }
            other => LinkError::Protocol(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ModbusLink for RtuLink {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        check_read_count(count)?;

        self.ctx.set_slave(Slave(unit));
        match self.ctx.read_holding_registers(address, count).await {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(code)) => Err(LinkError::Exception(code)),
            Err(err) => Err(self.classify(err)),
        }
    }

    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }

        self.ctx.set_slave(Slave(unit));
        match self.ctx.write_single_register(address, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(code)) => Err(LinkError::Exception(code)),
            Err(err) => Err(self.classify(err)),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        if self.open {
            if let Err(e) = self.ctx.disconnect().await {
                debug!("Error while closing {}: {}", self.port, e);
            }
            self.open = false;
        }
    }
}
