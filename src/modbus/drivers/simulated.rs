// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated RS-485 bus populated with gas-sensor modules
//!
//! This driver replaces the serial port with an in-process bus. Each
//! [`SimulatedSensor`] implements the module register map:
//!
//! | Register Address | Behaviour |
//! |-----------------|-----------|
//! | 2 | Always readable |
//! | 3 | Factory serial number, writes are rejected |
//! | 4 | Stages a new bus address, applied on reboot |
//! | 17 | `42330` reboots the module, other values are ignored |
//! | 255 | Feature flags, read/write |
//!
//! Any other register answers `IllegalDataAddress`. When no module listens on
//! the requested unit the request times out, when several modules share the
//! unit their answers collide and the frame is garbled.
//!
//! The bus can also emulate the operator: modules queued with
//! [`SimulatedBus::queue_factory_units`] are attached at the probe address one
//! at a time, each time the module occupying it reboots onto its new address.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use tokio_modbus::ExceptionCode;

use super::{check_read_count, LinkError, LinkOpener, LinkSettings, ModbusLink};
use crate::modbus::{
    BUZZER_ENABLE_BIT, CMD_SOFT_REBOOT, PROBE_ADDRESS, REG_BUS_ADDRESS, REG_COMMAND,
    REG_FEATURE_FLAGS, REG_LIVENESS, REG_SERIAL,
};

/// Feature flags of a factory-default module: buzzer on, alarm relay on.
const FACTORY_FEATURE_FLAGS: u16 = (1 << BUZZER_ENABLE_BIT) | 0x0001;

/// A simulated gas-sensor module
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    /// Address the module currently answers on
    address: u8,
    /// Address written to register 4, effective after the next reboot
    staged_address: Option<u8>,
    /// Holding registers keyed by register address
    registers: HashMap<u16, u16>,
    /// Number of reboots performed
    reboots: u32,
}

impl SimulatedSensor {
    /// A module fresh from the factory, listening on the probe address
    pub fn factory_default(serial: u16) -> Self {
        Self::at_address(serial, PROBE_ADDRESS)
    }

    /// A module already listening on `address`
    pub fn at_address(serial: u16, address: u8) -> Self {
        let mut registers = HashMap::new();
        registers.insert(REG_LIVENESS, 1);
        registers.insert(REG_SERIAL, serial);
        registers.insert(REG_BUS_ADDRESS, address as u16);
        registers.insert(REG_COMMAND, 0);
        registers.insert(REG_FEATURE_FLAGS, FACTORY_FEATURE_FLAGS);
        Self {
            address,
            staged_address: None,
            registers,
            reboots: 0,
        }
    }

    pub fn serial(&self) -> u16 {
        self.registers.get(&REG_SERIAL).copied().unwrap_or_default()
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn feature_flags(&self) -> u16 {
        self.registers
            .get(&REG_FEATURE_FLAGS)
            .copied()
            .unwrap_or_default()
    }

    pub fn buzzer_enabled(&self) -> bool {
        self.feature_flags() & (1 << BUZZER_ENABLE_BIT) != 0
    }

    pub fn reboots(&self) -> u32 {
        self.reboots
    }

    fn read(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        register_read(&self.registers, addr, cnt)
    }

    /// Apply a single register write, returning `true` when the module rebooted
    fn write(&mut self, addr: u16, value: u16) -> Result<bool, ExceptionCode> {
        match addr {
            REG_SERIAL | REG_LIVENESS => Err(ExceptionCode::IllegalDataAddress),
            REG_BUS_ADDRESS => {
                let new_address = u8::try_from(value)
                    .ok()
                    .filter(|a| (1..=247).contains(a))
                    .ok_or(ExceptionCode::IllegalDataValue)?;
                register_write(&mut self.registers, addr, &[value])?;
                self.staged_address = Some(new_address);
                Ok(false)
            }
            REG_COMMAND => {
                if value == CMD_SOFT_REBOOT {
                    if let Some(new_address) = self.staged_address.take() {
                        self.address = new_address;
                    }
                    self.reboots += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => register_write(&mut self.registers, addr, &[value]).map(|_| false),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    sensors: Vec<SimulatedSensor>,
    factory_queue: VecDeque<u16>,
    cable_connected: bool,
    /// Communication faults to inject before serving requests again
    pending_faults: u32,
    /// Incremented on every unplug so that links opened earlier go stale
    generation: u64,
    requests: u64,
    opens: u64,
}

/// Shared handle to a simulated RS-485 line
///
/// Cloning the handle shares the same line, which lets tests keep one clone
/// to inspect the modules while the transport drives another.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// An empty, connected bus
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                cable_connected: true,
                ..BusState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking test thread must not take the whole bus down with it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a module to the line
    pub fn attach(&self, sensor: SimulatedSensor) {
        debug!(
            "Simulated bus: attaching SN={} at address {}",
            sensor.serial(),
            sensor.address()
        );
        self.lock().sensors.push(sensor);
    }

    /// Remove the module with the given serial number, returning it
    pub fn detach(&self, serial: u16) -> Option<SimulatedSensor> {
        let mut state = self.lock();
        let index = state.sensors.iter().position(|s| s.serial() == serial)?;
        Some(state.sensors.remove(index))
    }

    /// Queue factory-default modules that are plugged in one after the other
    ///
    /// The first queued module is attached immediately when the probe address
    /// is free; every following one is attached as soon as the module holding
    /// the probe address reboots onto a new address.
    pub fn queue_factory_units(&self, serials: impl IntoIterator<Item = u16>) {
        let mut state = self.lock();
        state.factory_queue.extend(serials);
        feed_probe_address(&mut state);
    }

    /// Snapshot of the module with the given serial number
    pub fn sensor(&self, serial: u16) -> Option<SimulatedSensor> {
        self.lock()
            .sensors
            .iter()
            .find(|s| s.serial() == serial)
            .cloned()
    }

    /// Snapshot of every module on the line
    pub fn sensors(&self) -> Vec<SimulatedSensor> {
        self.lock().sensors.clone()
    }

    /// Plug or unplug the USB/RS-485 adapter
    ///
    /// Unplugging invalidates every open link; opening fails until the cable
    /// is plugged back in.
    pub fn set_cable_connected(&self, connected: bool) {
        let mut state = self.lock();
        if state.cable_connected && !connected {
            state.generation += 1;
        }
        state.cable_connected = connected;
        info!(
            "Simulated bus: cable {}",
            if connected { "plugged in" } else { "unplugged" }
        );
    }

    /// Make the next `count` requests fail with a communication error
    pub fn inject_faults(&self, count: u32) {
        self.lock().pending_faults += count;
    }

    /// Number of requests that reached the line
    pub fn request_count(&self) -> u64 {
        self.lock().requests
    }

    /// Number of successful link opens
    pub fn open_count(&self) -> u64 {
        self.lock().opens
    }

    /// Serve one request arriving on the wire
    fn transact(
        &self,
        generation: u64,
        unit: u8,
        request: WireRequest,
        timeout: Duration,
    ) -> Result<Vec<u16>, LinkError> {
        let mut state = self.lock();
        if !state.cable_connected || state.generation != generation {
            return Err(LinkError::Closed);
        }
        state.requests += 1;

        if state.pending_faults > 0 {
            state.pending_faults -= 1;
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected line fault",
            )));
        }

        let listening: Vec<usize> = state
            .sensors
            .iter()
            .enumerate()
            .filter(|(_, s)| s.address == unit)
            .map(|(i, _)| i)
            .collect();

        let index = match listening.as_slice() {
            [] => return Err(LinkError::Timeout(timeout)),
            [index] => *index,
            _ => {
                return Err(LinkError::Protocol(format!(
                    "{} devices answered on address {}",
                    listening.len(),
                    unit
                )))
            }
        };

        match request {
            WireRequest::ReadHolding { address, count } => state.sensors[index]
                .read(address, count)
                .map_err(LinkError::Exception),
            WireRequest::WriteSingle { address, value } => {
                let rebooted = state.sensors[index]
                    .write(address, value)
                    .map_err(LinkError::Exception)?;
                if rebooted {
                    debug!(
                        "Simulated bus: SN={} rebooted onto address {}",
                        state.sensors[index].serial(),
                        state.sensors[index].address
                    );
                    feed_probe_address(&mut state);
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Attach the next queued factory unit when nothing answers on the probe address
fn feed_probe_address(state: &mut BusState) {
    if state.sensors.iter().any(|s| s.address == PROBE_ADDRESS) {
        return;
    }
    if let Some(serial) = state.factory_queue.pop_front() {
        debug!("Simulated bus: next factory unit SN={} plugged in", serial);
        state.sensors.push(SimulatedSensor::factory_default(serial));
    }
}

#[derive(Debug, Clone, Copy)]
enum WireRequest {
    ReadHolding { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
}

/// [`LinkOpener`] handing out links onto a [`SimulatedBus`]
#[derive(Debug, Clone)]
pub struct SimulatedOpener {
    bus: SimulatedBus,
}

impl SimulatedOpener {
    pub fn new(bus: SimulatedBus) -> Self {
        Self { bus }
    }
}

#[async_trait::async_trait]
impl LinkOpener for SimulatedOpener {
    async fn open(&self, settings: &LinkSettings) -> io::Result<Box<dyn ModbusLink>> {
        let generation = {
            let mut state = self.bus.lock();
            if !state.cable_connected {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: no such device", settings.port),
                ));
            }
            state.opens += 1;
            state.generation
        };

        Ok(Box::new(SimulatedLink {
            bus: self.bus.clone(),
            generation,
            timeout: settings.timeout,
            closed: false,
        }))
    }
}

/// Open link onto a [`SimulatedBus`]
struct SimulatedLink {
    bus: SimulatedBus,
    generation: u64,
    timeout: Duration,
    closed: bool,
}

impl SimulatedLink {
    fn transact(&mut self, unit: u8, request: WireRequest) -> Result<Vec<u16>, LinkError> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        self.bus
            .transact(self.generation, unit, request, self.timeout)
    }
}

#[async_trait::async_trait]
impl ModbusLink for SimulatedLink {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        check_read_count(count)?;
        self.transact(unit, WireRequest::ReadHolding { address, count })
    }

    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        self.transact(unit, WireRequest::WriteSingle { address, value })
            .map(|_| ())
    }

    fn is_open(&self) -> bool {
        if self.closed {
            return false;
        }
        let state = self.bus.lock();
        state.cable_connected && state.generation == self.generation
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Read one or more registers from a HashMap-backed register bank
///
/// Returns `ExceptionCode::IllegalDataAddress` if any requested register
/// address does not exist.
fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];

    for i in 0..cnt {
        let reg_addr = addr.checked_add(i).ok_or(ExceptionCode::IllegalDataAddress)?;
        match registers.get(&reg_addr) {
            Some(r) => response_values[i as usize] = *r,
            None => {
                debug!(
                    "Exception::IllegalDataAddress - Register {} not found",
                    reg_addr
                );
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
    }

    Ok(response_values)
}

/// Write values to existing registers of a HashMap-backed register bank
fn register_write(
    registers: &mut HashMap<u16, u16>,
    addr: u16,
    values: &[u16],
) -> Result<(), ExceptionCode> {
    for (i, value) in values.iter().enumerate() {
        let reg_addr = addr
            .checked_add(i as u16)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        match registers.get_mut(&reg_addr) {
            Some(r) => *r = *value,
            None => {
                debug!(
                    "Exception::IllegalDataAddress - Register {} not found",
                    reg_addr
                );
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
    }

    Ok(())
}
