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

//! raphael-thermal - thermal throttling service
//!
//! Reads temperature sensors (physical and virtual), classifies them into
//! severity levels, and drives cooling devices through PID power budgets and
//! hard limits, optionally relaxed by measured rail power.

pub mod config;
pub mod constants;
pub mod cpu;
pub mod engine;
pub mod facade;
pub mod files;
pub mod formula;
pub mod logger;
pub mod power;
pub mod power_hint;
pub mod service;
pub mod settings;
pub mod types;
pub mod watcher;

pub use facade::{Thermal, ThermalChangedCallback};
pub use thermal_error::{Result, ThermalError};

#[cfg(test)]
pub mod test_utils;
