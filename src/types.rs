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

//! Shared value types: severity levels, sensor/cooling-device kinds and the
//! records returned by queries and notifications.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thermal_error::ThermalError;

/// Number of throttling severity levels
pub const SEVERITY_COUNT: usize = 7;

/// One float per severity level (thresholds, PID coefficients, weights)
pub type ThrottlingArray = [f32; SEVERITY_COUNT];

/// One integer per severity level (hard limits, ceilings, floors)
pub type CdevArray = [i32; SEVERITY_COUNT];

/// Ordered throttling level. `None` is the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    None = 0,
    Light = 1,
    Moderate = 2,
    Severe = 3,
    Critical = 4,
    Emergency = 5,
    Shutdown = 6,
}

impl Severity {
    pub const ALL: [Severity; SEVERITY_COUNT] = [
        Severity::None,
        Severity::Light,
        Severity::Moderate,
        Severity::Severe,
        Severity::Critical,
        Severity::Emergency,
        Severity::Shutdown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Severity> {
        Self::ALL.get(idx).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Light => "LIGHT",
            Severity::Moderate => "MODERATE",
            Severity::Severe => "SEVERE",
            Severity::Critical => "CRITICAL",
            Severity::Emergency => "EMERGENCY",
            Severity::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensor kind, used for query filters and listener filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemperatureType {
    Unknown,
    Cpu,
    Gpu,
    Battery,
    Skin,
    UsbPort,
    PowerAmplifier,
    BclVoltage,
    BclCurrent,
    BclPercentage,
    Npu,
}

impl TemperatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            TemperatureType::Unknown => "UNKNOWN",
            TemperatureType::Cpu => "CPU",
            TemperatureType::Gpu => "GPU",
            TemperatureType::Battery => "BATTERY",
            TemperatureType::Skin => "SKIN",
            TemperatureType::UsbPort => "USB_PORT",
            TemperatureType::PowerAmplifier => "POWER_AMPLIFIER",
            TemperatureType::BclVoltage => "BCL_VOLTAGE",
            TemperatureType::BclCurrent => "BCL_CURRENT",
            TemperatureType::BclPercentage => "BCL_PERCENTAGE",
            TemperatureType::Npu => "NPU",
        }
    }

    /// Collapse to the reduced set understood by legacy listings
    pub fn legacy(self) -> TemperatureType {
        match self {
            TemperatureType::Cpu
            | TemperatureType::Gpu
            | TemperatureType::Battery
            | TemperatureType::Skin => self,
            _ => TemperatureType::Unknown,
        }
    }
}

impl fmt::Display for TemperatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemperatureType {
    type Err = ThermalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s {
            "UNKNOWN" => TemperatureType::Unknown,
            "CPU" => TemperatureType::Cpu,
            "GPU" => TemperatureType::Gpu,
            "BATTERY" => TemperatureType::Battery,
            "SKIN" => TemperatureType::Skin,
            "USB_PORT" => TemperatureType::UsbPort,
            "POWER_AMPLIFIER" => TemperatureType::PowerAmplifier,
            "BCL_VOLTAGE" => TemperatureType::BclVoltage,
            "BCL_CURRENT" => TemperatureType::BclCurrent,
            "BCL_PERCENTAGE" => TemperatureType::BclPercentage,
            "NPU" => TemperatureType::Npu,
            other => return Err(ThermalError::invalid("Type", format!("unknown sensor type {other:?}"))),
        };
        Ok(t)
    }
}

/// Cooling device kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingType {
    Fan,
    Battery,
    Cpu,
    Gpu,
    Modem,
    Npu,
    Component,
}

impl CoolingType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoolingType::Fan => "FAN",
            CoolingType::Battery => "BATTERY",
            CoolingType::Cpu => "CPU",
            CoolingType::Gpu => "GPU",
            CoolingType::Modem => "MODEM",
            CoolingType::Npu => "NPU",
            CoolingType::Component => "COMPONENT",
        }
    }
}

impl fmt::Display for CoolingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoolingType {
    type Err = ThermalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s {
            "FAN" => CoolingType::Fan,
            "BATTERY" => CoolingType::Battery,
            "CPU" => CoolingType::Cpu,
            "GPU" => CoolingType::Gpu,
            "MODEM" => CoolingType::Modem,
            "NPU" => CoolingType::Npu,
            "COMPONENT" => CoolingType::Component,
            other => return Err(ThermalError::invalid("Type", format!("unknown cooling type {other:?}"))),
        };
        Ok(t)
    }
}

/// A classified temperature reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Temperature {
    #[serde(rename = "type")]
    pub kind: TemperatureType,
    pub name: String,
    pub value: f32,
    pub throttling_status: Severity,
}

/// Legacy temperature record carrying fixed thresholds instead of a status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureV1 {
    #[serde(rename = "type")]
    pub kind: TemperatureType,
    pub name: String,
    pub current_value: f32,
    pub throttling_threshold: f32,
    pub shutdown_threshold: f32,
    pub vr_throttling_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureThreshold {
    #[serde(rename = "type")]
    pub kind: TemperatureType,
    pub name: String,
    pub hot_thresholds: ThrottlingArray,
    pub cold_thresholds: ThrottlingArray,
    pub vr_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoolingDevice {
    #[serde(rename = "type")]
    pub kind: CoolingType,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    pub name: String,
    pub active: u64,
    pub total: u64,
    pub is_online: bool,
}

/// Render a per-severity array the way the debug dump prints it
pub(crate) fn fmt_array<T: fmt::Display>(values: &[T]) -> String {
    let mut out = String::from("[");
    for v in values {
        out.push_str(&v.to_string());
        out.push(' ');
    }
    out.push(']');
    out
}
