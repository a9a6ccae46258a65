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

use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::{CdevId, SensorId};
use crate::types::Severity;

/// Mutable state of one sensor, owned by the watcher pass
#[derive(Debug, Clone, PartialEq)]
pub struct SensorStatus {
    pub severity: Severity,
    pub prev_hot_severity: Severity,
    pub prev_cold_severity: Severity,
    pub prev_hint_severity: Severity,
    /// `None` until the first evaluation
    pub last_update_time: Option<Instant>,
    pub err_integral: f32,
    pub prev_err: f32,
    pub pid_request_map: BTreeMap<CdevId, i32>,
    pub hard_limit_request_map: BTreeMap<CdevId, i32>,
}

impl Default for SensorStatus {
    fn default() -> Self {
        Self {
            severity: Severity::None,
            prev_hot_severity: Severity::None,
            prev_cold_severity: Severity::None,
            prev_hint_severity: Severity::None,
            last_update_time: None,
            err_integral: 0.0,
            prev_err: f32::NAN,
            pid_request_map: BTreeMap::new(),
            hard_limit_request_map: BTreeMap::new(),
        }
    }
}

impl SensorStatus {
    pub fn requests_cdevs(&self) -> bool {
        !self.pid_request_map.is_empty() || !self.hard_limit_request_map.is_empty()
    }
}

/// Last state each sensor requested from one cooling device
pub type CdevRequestStatus = BTreeMap<SensorId, i32>;
