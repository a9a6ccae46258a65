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

//! Throttling engine
//!
//! Pure control-law functions live in `throttling`, mutable per-sensor and
//! per-device bookkeeping in `status`, and the `ThermalHelper` tying them to
//! sysfs in `helper`.

mod helper;
mod status;
pub mod throttling;

pub use helper::{NotificationCallback, ThermalHelper};
pub use status::{CdevRequestStatus, SensorStatus};
pub use throttling::{
    merge_cdev_request, pid_power_budget, pid_target_state, request_cdev_by_power,
    request_cdev_by_severity, severity_from_thresholds,
};
