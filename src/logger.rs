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

//! JSON-lines event journal.
//!
//! Records severity transitions and cooling-device writes, one JSON object
//! per line. Disabled until [`init_journal`] opens a file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thermal_error::{Result, ThermalError};

lazy_static! {
    static ref JOURNAL: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Open `path` for appending and route [`log_event`] to it.
pub fn init_journal<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ThermalError::FileWrite { path: path.to_path_buf(), source })?;
    *JOURNAL.lock() = Some(file);
    Ok(())
}

/// Stop journaling and close the file
pub fn close_journal() {
    *JOURNAL.lock() = None;
}

pub fn is_enabled() -> bool {
    JOURNAL.lock().is_some()
}

pub fn log_event(event: &str, data: Value) {
    let mut guard = JOURNAL.lock();
    let Some(f) = guard.as_mut() else { return };
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    });
    // Best effort
    let _ = writeln!(f, "{line}");
}
