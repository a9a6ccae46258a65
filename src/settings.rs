/*
 * This file is part of raphael-thermal.
 *
 * Copyright (C) 2025 raphael-thermal contributors
 *
 * raphael-thermal is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * raphael-thermal is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with raphael-thermal. If not, see <https://www.gnu.org/licenses/>.
 */

//! Daemon runtime settings
//!
//! Stored as JSON next to the thermal configuration. Every field has a
//! default, so a missing or partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thermal_error::{Result, ThermalError};

use crate::constants::paths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Thermal configuration document
    pub config_path: PathBuf,
    /// Directory holding `thermal_zone*` and `cooling_device*`
    pub thermal_root: PathBuf,
    /// Directory holding `iio:device*` energy meters
    pub iio_root: PathBuf,
    pub proc_stat: PathBuf,
    pub cpu_root: PathBuf,
    /// Park every cooling device at 0 and never start the watcher
    pub disable_thermal_control: bool,
    /// Ignore power-rail bindings while parsing sensors
    pub disable_power_link: bool,
    /// Optional JSON-lines event journal
    pub journal_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(paths::CONFIG_FILE),
            thermal_root: PathBuf::from(paths::THERMAL_ROOT),
            iio_root: PathBuf::from(paths::IIO_ROOT),
            proc_stat: PathBuf::from(paths::PROC_STAT),
            cpu_root: PathBuf::from(paths::CPU_ROOT),
            disable_thermal_control: false,
            disable_power_link: false,
            journal_path: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|source| ThermalError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = serde_json::from_str(&data)?;
        settings.validate().map_err(ThermalError::config)?;
        Ok(settings)
    }

    /// Basic sanity checks, mirrors the checks done on saved profiles
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.config_path.as_os_str().is_empty() {
            return Err("config_path cannot be empty".to_string());
        }
        if self.thermal_root.as_os_str().is_empty() {
            return Err("thermal_root cannot be empty".to_string());
        }
        if let Some(j) = &self.journal_path {
            if j.as_os_str().is_empty() {
                return Err("journal_path cannot be empty when set".to_string());
            }
        }
        Ok(())
    }
}
