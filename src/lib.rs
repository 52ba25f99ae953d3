// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rust sensor provisioning library
//!
//! Provisions factory-default gas-sensor modules on an RS-485 Modbus RTU bus:
//! each module is discovered at the probe address, given its permanent bus
//! address, optionally silenced, rebooted, verified at its new address, and
//! its factory serial number is recorded in the plant work order.

pub mod config;
pub mod console;
pub mod daemon;
pub mod modbus;
pub mod provisioning;
pub mod work_order;
