// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus communication module
//!
//! This module provides the Modbus RTU client side of the provisioning tool:
//! a thread-safe transport over a single RS-485 serial line, the drivers that
//! open the physical (or simulated) link, and the register map spoken by the
//! gas-sensor modules.
//!
//! ## Key Components
//!
//! - [`ModbusTransport`]: serialized, auto-reconnecting access to holding registers.
//! - [`RegisterBus`]: the seam the provisioning sequencer talks to.
//! - [`drivers`]: the RTU serial driver and the simulated bus.
//!
//! ## Register Map
//!
//! All values are 16-bit holding registers.
//!
//! | Register Address | Access | Description |
//! |-----------------|--------|-------------|
//! | 2 | read | Liveness probe, any successful read means the device is present |
//! | 3 | read | Factory serial number |
//! | 4 | write | Permanent bus address |
//! | 17 | write | Command register, `42330` triggers a soft reboot |
//! | 255 | read/write | Feature flags, bit 9 enables the buzzer |

pub mod drivers;
pub mod transport;

pub use transport::{ModbusTransport, RegisterBus, TransportError, TransportErrorKind};

/// Bus address every factory-default module answers on.
pub const PROBE_ADDRESS: u8 = 1;

/// Highest unit id usable by a Modbus RTU slave.
pub const MAX_DEVICE_ADDRESS: u8 = 247;

/// Liveness probe register.
pub const REG_LIVENESS: u16 = 2;

/// Factory serial number register (read-only).
pub const REG_SERIAL: u16 = 3;

/// Permanent bus address register.
pub const REG_BUS_ADDRESS: u16 = 4;

/// Command register.
pub const REG_COMMAND: u16 = 17;

/// Value written to [`REG_COMMAND`] to trigger a soft reboot.
pub const CMD_SOFT_REBOOT: u16 = 42330;

/// Feature-flag bitmask register.
pub const REG_FEATURE_FLAGS: u16 = 255;

/// Bit of [`REG_FEATURE_FLAGS`] that enables the buzzer.
pub const BUZZER_ENABLE_BIT: u16 = 9;

/// Clear the buzzer-enable bit, leaving every other feature flag untouched.
pub fn clear_buzzer_flag(flags: u16) -> u16 {
    flags & !(1 << BUZZER_ENABLE_BIT)
}
