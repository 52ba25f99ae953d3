// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Work orders
//!
//! A work order is the CSV export of a plant's gas-sensor list. It is both the
//! task source of a run and the place serial numbers are written back to.
//!
//! ```text
//! model,address,location,buzzer,serial,enabled
//! GS-200,5,Boiler room,,,
//! GS-200,6,Garage,Buzzer Disable,,no
//! ```
//!
//! The header is row 1, so the first device is row 2. Rows without an
//! address are kept untouched but never turned into tasks. Columns other than
//! the known ones are preserved when the file is saved.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::anyhow;
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use log::{debug, info};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::Config;
use crate::provisioning::{ProvisioningTask, RowRef, SerialSink, TaskError};

/// Buzzer cell value requesting the buzzer to be disabled.
pub const BUZZER_DISABLE: &str = "Buzzer Disable";

const COL_MODEL: &str = "model";
const COL_ADDRESS: &str = "address";
const COL_LOCATION: &str = "location";
const COL_BUZZER: &str = "buzzer";
const COL_SERIAL: &str = "serial";
const COL_ENABLED: &str = "enabled";

#[derive(Error, Debug)]
pub enum WorkOrderError {
    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("work order has no '{0}' column")]
    MissingColumn(&'static str),

    #[error("{row}: invalid address '{value}'")]
    InvalidAddress { row: RowRef, value: String },

    #[error("{row}: invalid enabled flag '{value}'")]
    InvalidEnabled { row: RowRef, value: String },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("{0} does not exist in the work order")]
    UnknownRow(RowRef),

    #[error("path template uses {{base}} but no base directory is configured")]
    MissingBaseDir,

    #[error("invalid plant number '{0}'")]
    InvalidPlant(String),

    #[error("no work order found at {}", .0.display())]
    NotFound(PathBuf),
}

/// Positions of the known columns in the header
#[derive(Debug, Clone, Copy)]
struct Columns {
    model: usize,
    address: usize,
    location: usize,
    buzzer: usize,
    serial: usize,
    enabled: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, WorkOrderError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let require = |name: &'static str| find(name).ok_or(WorkOrderError::MissingColumn(name));

        Ok(Self {
            model: require(COL_MODEL)?,
            address: require(COL_ADDRESS)?,
            location: require(COL_LOCATION)?,
            buzzer: require(COL_BUZZER)?,
            serial: require(COL_SERIAL)?,
            enabled: find(COL_ENABLED),
        })
    }
}

/// Read-only view of one work-order row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOrderEntry<'a> {
    pub row: RowRef,
    pub model: &'a str,
    pub address: &'a str,
    pub location: &'a str,
    pub buzzer: &'a str,
    pub serial: &'a str,
}

/// A loaded work order
#[derive(Debug, Clone)]
pub struct WorkOrder {
    headers: StringRecord,
    records: Vec<StringRecord>,
    columns: Columns,
}

impl WorkOrder {
    /// Load a work order from a CSV file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WorkOrderError> {
        let path = path.as_ref();
        debug!("Loading work order from {:?}", path);
        let file = fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse a work order from any CSV source.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, WorkOrderError> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        let columns = Columns::from_headers(&headers)?;

        let records = reader
            .records()
            .collect::<Result<Vec<StringRecord>, csv::Error>>()?;
        debug!("Work order holds {} row(s)", records.len());

        Ok(Self {
            headers,
            records,
            columns,
        })
    }

    /// Number of data rows, including rows without an address.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = WorkOrderEntry<'_>> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(move |(index, record)| WorkOrderEntry {
                row: row_of(index),
                model: field(record, self.columns.model),
                address: field(record, self.columns.address),
                location: field(record, self.columns.location),
                buzzer: field(record, self.columns.buzzer),
                serial: field(record, self.columns.serial),
            })
    }

    pub fn entry(&self, row: RowRef) -> Option<WorkOrderEntry<'_>> {
        self.entries().find(|entry| entry.row == row)
    }

    /// Build the provisioning tasks of every row that has an address.
    ///
    /// Rows listed in `skip_rows`, and rows whose `enabled` cell is false,
    /// become disabled tasks.
    pub fn tasks(&self, skip_rows: &[RowRef]) -> Result<Vec<ProvisioningTask>, WorkOrderError> {
        let mut tasks = Vec::new();
        for (index, record) in self.records.iter().enumerate() {
            let row = row_of(index);
            let address = field(record, self.columns.address);
            if address.is_empty() {
                continue;
            }

            let target = parse_address(address).ok_or_else(|| WorkOrderError::InvalidAddress {
                row,
                value: address.to_string(),
            })?;
            let buzzer_disable = field(record, self.columns.buzzer).eq_ignore_ascii_case(BUZZER_DISABLE);
            let enabled = match self.columns.enabled {
                Some(col) => parse_enabled(field(record, col)).ok_or_else(|| {
                    WorkOrderError::InvalidEnabled {
                        row,
                        value: field(record, col).to_string(),
                    }
                })?,
                None => true,
            };

            tasks.push(ProvisioningTask::new(
                row,
                target,
                buzzer_disable,
                enabled && !skip_rows.contains(&row),
            )?);
        }
        Ok(tasks)
    }

    /// Write a serial number into the serial column of `row`.
    pub fn set_serial(&mut self, row: RowRef, serial: u16) -> Result<(), WorkOrderError> {
        let index = (row.0 as usize)
            .checked_sub(2)
            .filter(|index| *index < self.records.len())
            .ok_or(WorkOrderError::UnknownRow(row))?;

        let serial_col = self.columns.serial;
        let record = &self.records[index];
        let width = record.len().max(serial_col + 1);
        let serial = serial.to_string();
        let updated: StringRecord = (0..width)
            .map(|col| {
                if col == serial_col {
                    serial.as_str()
                } else {
                    record.get(col).unwrap_or("")
                }
            })
            .collect();
        self.records[index] = updated;
        Ok(())
    }

    /// Save the work order, replacing `path` atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WorkOrderError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = WriterBuilder::new().flexible(true).from_writer(tmp.as_file_mut());
            writer.write_record(&self.headers)?;
            for record in &self.records {
                writer.write_record(record)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!("Work order saved to {:?}", path);
        Ok(())
    }
}

fn row_of(index: usize) -> RowRef {
    RowRef(index as u32 + 2)
}

fn field(record: &StringRecord, col: usize) -> &str {
    record.get(col).unwrap_or("")
}

/// Spreadsheet exports sometimes write integers as `5.0`.
fn parse_address(value: &str) -> Option<u16> {
    let value = value.trim();
    value
        .parse::<u16>()
        .ok()
        .or_else(|| value.strip_suffix(".0").and_then(|v| v.parse().ok()))
}

fn parse_enabled(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "x" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// [`SerialSink`] writing serial numbers into a work-order file.
///
/// The file is saved after every serial so an interrupted run loses at most
/// the device in progress.
pub struct CsvSerialSink {
    path: PathBuf,
    work_order: Mutex<WorkOrder>,
}

impl CsvSerialSink {
    pub fn new(path: impl Into<PathBuf>, work_order: WorkOrder) -> Self {
        Self {
            path: path.into(),
            work_order: Mutex::new(work_order),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state of the work order, including recorded serials.
    pub fn snapshot(&self) -> anyhow::Result<WorkOrder> {
        self.work_order
            .lock()
            .map(|wo| wo.clone())
            .map_err(|_| anyhow!("work order lock poisoned"))
    }
}

impl SerialSink for CsvSerialSink {
    fn persist(&self, row: &RowRef, serial: u16) -> anyhow::Result<()> {
        let mut work_order = self
            .work_order
            .lock()
            .map_err(|_| anyhow!("work order lock poisoned"))?;
        work_order.set_serial(*row, serial)?;
        work_order.save(&self.path)?;
        info!("{}: SN={} saved to {}", row, serial, self.path.display());
        Ok(())
    }
}

/// Expand a work-order path template for `plant`.
///
/// `{prefix}` is the first two digits of the plant number, which is how the
/// project share groups plants by year.
pub fn resolve_plant_path(
    template: &str,
    base_dir: Option<&Path>,
    plant: &str,
) -> Result<PathBuf, WorkOrderError> {
    let plant = plant.trim();
    if plant.len() < 2 || !plant.chars().all(|c| c.is_ascii_digit()) {
        return Err(WorkOrderError::InvalidPlant(plant.to_string()));
    }

    let mut path = template
        .replace("{prefix}", &plant[..2])
        .replace("{plant}", plant);
    if path.contains("{base}") {
        let base = base_dir.ok_or(WorkOrderError::MissingBaseDir)?;
        path = path.replace("{base}", &base.to_string_lossy());
    }
    Ok(PathBuf::from(path))
}

/// Find the work order of `plant` on the configured project share.
pub fn locate_work_order(config: &Config, plant: &str) -> Result<PathBuf, WorkOrderError> {
    let path = resolve_plant_path(
        &config.work_order.path_template,
        config.work_order.base_dir.as_deref(),
        plant,
    )?;
    if path.is_file() {
        Ok(path)
    } else {
        Err(WorkOrderError::NotFound(path))
    }
}
