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

//! Named sysfs file registry.
//!
//! Sensors register their `temp` node under the sensor name. Cooling devices
//! register a read node under the device name and a write node under
//! `<name>_w`, so state reporting and state requests can use different files.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use thermal_error::{Result, ThermalError};
use tracing::{debug, warn};

use crate::constants::sysfs::WRITE_SUFFIX;

#[derive(Debug, Default, Clone)]
pub struct ThermalFiles {
    files: HashMap<String, PathBuf>,
}

impl ThermalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` under `name`. A second registration replaces the first.
    pub fn add_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let name = name.into();
        let path = path.into();
        if !path.exists() {
            warn!(name = %name, path = %path.display(), "registered file does not exist yet");
        }
        if let Some(old) = self.files.insert(name.clone(), path) {
            debug!(name = %name, old = %old.display(), "replaced registered file");
        }
    }

    pub fn file_path(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    /// Read the file registered as `name`, trimmed of surrounding whitespace.
    pub fn read_file(&self, name: &str) -> Result<String> {
        let path = self
            .files
            .get(name)
            .ok_or_else(|| ThermalError::FileNotRegistered(name.to_string()))?;
        read_trimmed(path)
    }

    /// Write `value` to the request node of cooling device `cdev`.
    pub fn write_cdev_file(&self, cdev: &str, value: &str) -> Result<()> {
        let key = format!("{cdev}{WRITE_SUFFIX}");
        let path = self
            .files
            .get(&key)
            .ok_or_else(|| ThermalError::FileNotRegistered(key.clone()))?;
        fs::write(path, value).map_err(|source| ThermalError::FileWrite {
            path: path.clone(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub(crate) fn read_trimmed<P: AsRef<Path>>(p: P) -> Result<String> {
    let p = p.as_ref();
    let mut s = String::new();
    fs::File::open(p)
        .and_then(|mut f| f.read_to_string(&mut s))
        .map_err(|source| ThermalError::FileRead {
            path: p.to_path_buf(),
            source,
        })?;
    Ok(s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_registered_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "  41000  ").unwrap();

        let mut files = ThermalFiles::new();
        files.add_file("skin", &path);
        assert_eq!(files.read_file("skin").unwrap(), "41000");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_unregistered_name_fails() {
        let files = ThermalFiles::new();
        assert!(matches!(
            files.read_file("ghost"),
            Err(ThermalError::FileNotRegistered(_))
        ));
        assert!(files.write_cdev_file("ghost", "1").is_err());
    }

    #[test]
    fn test_duplicate_name_overwrites() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "1").unwrap();
        fs::write(&b, "2").unwrap();

        let mut files = ThermalFiles::new();
        files.add_file("x", &a);
        files.add_file("x", &b);
        assert_eq!(files.len(), 1);
        assert_eq!(files.read_file("x").unwrap(), "2");
    }

    #[test]
    fn test_separate_read_and_write_nodes() {
        let dir = TempDir::new().unwrap();
        let cur = dir.path().join("cur_state");
        let req = dir.path().join("request");
        fs::write(&cur, "0").unwrap();
        fs::write(&req, "0").unwrap();

        let mut files = ThermalFiles::new();
        files.add_file("cpu", &cur);
        files.add_file("cpu_w", &req);
        files.write_cdev_file("cpu", "4").unwrap();

        assert_eq!(fs::read_to_string(&req).unwrap(), "4");
        assert_eq!(files.read_file("cpu").unwrap(), "0");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let mut files = ThermalFiles::new();
        files.add_file("gone", dir.path().join("gone"));
        assert!(matches!(files.read_file("gone"), Err(ThermalError::FileRead { .. })));
    }
}
