// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Work-order location configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default location of a plant's sensor list relative to the shared project root.
///
/// `{base}` is replaced by [`WorkOrderConfig::base_dir`], `{prefix}` by the
/// first two digits of the plant number and `{plant}` by the plant number.
pub const DEFAULT_PATH_TEMPLATE: &str =
    "{base}/20{prefix}/{plant}/{plant}_Anlageinfos/DS_{plant}/Liste_{plant}.csv";

/// Where work orders are looked up when only a plant number is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkOrderConfig {
    /// Root folder of the project share.
    pub base_dir: Option<PathBuf>,

    /// Template of the work-order path, see [`DEFAULT_PATH_TEMPLATE`].
    pub path_template: String,
}

impl Default for WorkOrderConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
        }
    }
}
