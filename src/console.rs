// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Terminal presentation of a provisioning run

use std::io::{self, Write};

use chrono::Local;

use crate::provisioning::{ProvisioningObserver, RowRef, RunReport, TaskOutcome};
use crate::work_order::WorkOrder;

/// Prints the log feed and status transitions on stdout, one timestamped
/// line each.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleObserver;

impl ConsoleObserver {
    fn print(&self, line: &str) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        // A closed stdout must not take the worker down
        let _ = writeln!(out, "[{}] {}", Local::now().format("%H:%M:%S"), line);
    }
}

impl ProvisioningObserver for ConsoleObserver {
    fn on_log(&self, line: &str) {
        self.print(line);
    }

    fn on_task_status(&self, row: &RowRef, outcome: &TaskOutcome) {
        self.print(&format!("{} -> {}", row, outcome));
    }

    fn on_task_started(&self, row: &RowRef) {
        self.print(&format!(">>> {} (s = skip, q = stop)", row));
    }
}

/// Render the end-of-run table.
pub fn format_summary(report: &RunReport, work_order: Option<&WorkOrder>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<8} {:<12} {:<24} {}\n",
        "Row", "Model", "Location", "Status"
    ));
    for (row, outcome) in &report.outcomes {
        let entry = work_order.and_then(|wo| wo.entry(*row));
        out.push_str(&format!(
            "{:<8} {:<12} {:<24} {}\n",
            row.0,
            entry.as_ref().map(|e| e.model).unwrap_or("-"),
            entry.as_ref().map(|e| e.location).unwrap_or("-"),
            outcome
        ));
    }
    out.push_str(&format!(
        "{} ok, {} failed, {} skipped{}",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        if report.aborted { ", run aborted" } else { "" }
    ));
    out
}
