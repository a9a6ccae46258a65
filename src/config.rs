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

//! Thermal configuration loader.
//!
//! The document has three top-level sections, `Sensors`, `CoolingDevices`
//! and `PowerRails`. Each section is parsed all-or-nothing: one bad entry
//! rejects the whole section. Parsed entries land in dense arenas indexed by
//! [`SensorId`], [`CdevId`] and [`RailId`], with a name table built once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thermal_error::{Result, ThermalError};
use tracing::{debug, error, info};

use crate::constants::timing::{MIN_POLL_INTERVAL, UEVENT_POLL_TIMEOUT};
use crate::formula::Formula;
use crate::types::{CdevArray, CoolingType, TemperatureType, ThrottlingArray, SEVERITY_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CdevId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RailId(pub usize);

// ============================================================================
// Parsed descriptions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSensorInfo {
    pub linked_sensors: Vec<String>,
    /// Resolved `linked_sensors`, same order
    pub linked: Vec<SensorId>,
    pub coefficients: Vec<f32>,
    pub offset: f32,
    pub trigger_sensor: String,
    pub trigger: Option<SensorId>,
    pub formula: Formula,
}

/// PID coefficients, one entry per severity level
#[derive(Debug, Clone, PartialEq)]
pub struct PidInfo {
    pub k_po: ThrottlingArray,
    pub k_pu: ThrottlingArray,
    pub k_i: ThrottlingArray,
    pub k_d: ThrottlingArray,
    pub i_max: ThrottlingArray,
    pub max_alloc_power: ThrottlingArray,
    pub min_alloc_power: ThrottlingArray,
    pub s_power: ThrottlingArray,
    pub i_cutoff: ThrottlingArray,
}

impl PidInfo {
    /// Every level defining `s_power` must define all other terms, and at
    /// least one level must do so.
    fn is_valid_combination(&self) -> bool {
        let mut valid = false;
        for j in 0..SEVERITY_COUNT {
            if self.s_power[j].is_nan() {
                continue;
            }
            let others = [
                self.k_po[j],
                self.k_pu[j],
                self.k_i[j],
                self.k_d[j],
                self.i_max[j],
                self.max_alloc_power[j],
                self.min_alloc_power[j],
                self.i_cutoff[j],
            ];
            if others.iter().any(|v| v.is_nan()) {
                return false;
            }
            valid = true;
        }
        valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseLogic {
    #[default]
    None,
    Increase,
    Decrease,
    Stepwise,
    ReleaseToFloor,
}

impl ReleaseLogic {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseLogic::None => "NONE",
            ReleaseLogic::Increase => "INCREASE",
            ReleaseLogic::Decrease => "DECREASE",
            ReleaseLogic::Stepwise => "STEPWISE",
            ReleaseLogic::ReleaseToFloor => "RELEASE_TO_FLOOR",
        }
    }
}

impl FromStr for ReleaseLogic {
    type Err = ThermalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INCREASE" => Ok(ReleaseLogic::Increase),
            "DECREASE" => Ok(ReleaseLogic::Decrease),
            "STEPWISE" => Ok(ReleaseLogic::Stepwise),
            "RELEASE_TO_FLOOR" => Ok(ReleaseLogic::ReleaseToFloor),
            other => Err(ThermalError::invalid("ReleaseLogic", format!("unknown release logic {other:?}"))),
        }
    }
}

/// A cooling device bound to a sensor
#[derive(Debug, Clone, PartialEq)]
pub struct BindedCdevInfo {
    pub cdev_name: String,
    pub cdev: Option<CdevId>,
    pub limit_info: CdevArray,
    pub power_thresholds: ThrottlingArray,
    pub release_logic: ReleaseLogic,
    pub high_power_check: bool,
    pub throttling_with_power_link: bool,
    pub cdev_weight_for_pid: ThrottlingArray,
    pub cdev_ceiling: CdevArray,
    pub cdev_floor_with_power_link: CdevArray,
    /// Empty when no rail is bound
    pub power_rail_name: String,
    pub power_rail: Option<RailId>,
}

impl BindedCdevInfo {
    pub fn has_pid_weight(&self) -> bool {
        self.cdev_weight_for_pid.iter().any(|w| !w.is_nan())
    }

    pub fn has_hard_limit(&self) -> bool {
        self.limit_info.iter().any(|&l| l > 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorInfo {
    pub name: String,
    pub kind: TemperatureType,
    pub hot_thresholds: ThrottlingArray,
    pub cold_thresholds: ThrottlingArray,
    pub hot_hysteresis: ThrottlingArray,
    pub cold_hysteresis: ThrottlingArray,
    pub temp_path: Option<PathBuf>,
    pub vr_threshold: f32,
    pub multiplier: f32,
    pub polling_delay: Duration,
    pub passive_delay: Duration,
    pub send_cb: bool,
    pub send_powerhint: bool,
    pub is_monitor: bool,
    pub virtual_sensor: Option<VirtualSensorInfo>,
    pub pid: Option<PidInfo>,
    pub binded_cdevs: Vec<BindedCdevInfo>,
}

impl SensorInfo {
    pub fn is_virtual(&self) -> bool {
        self.virtual_sensor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CdevInfo {
    pub name: String,
    pub kind: CoolingType,
    pub read_path: Option<PathBuf>,
    pub write_path: Option<PathBuf>,
    /// Power draw per state, state 0 first (highest power)
    pub state2power: Vec<f32>,
    pub power_rail: String,
    /// `i32::MAX` until probed from sysfs
    pub max_state: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualPowerRailInfo {
    /// Raw rail names as reported by the energy meter
    pub linked_power_rails: Vec<String>,
    pub coefficients: Vec<f32>,
    pub offset: f32,
    pub formula: Formula,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerRailInfo {
    pub name: String,
    pub rail: String,
    pub power_sample_count: usize,
    pub power_sample_delay: Duration,
    pub virtual_power_rail: Option<VirtualPowerRailInfo>,
}

/// Parser switches that do not live in the document itself
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Ignore every power-link field in sensor bindings
    pub power_link_disabled: bool,
}

// ============================================================================
// Raw document shape
// ============================================================================

/// A number that may be written as a JSON string ("NAN", "max", "35.5")
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Number {
    Num(f64),
    Text(String),
}

impl Number {
    fn as_f32(&self, field: &str) -> Result<f32> {
        match self {
            Number::Num(n) => Ok(*n as f32),
            Number::Text(s) if s.trim().eq_ignore_ascii_case("nan") => Ok(f32::NAN),
            Number::Text(s) => s
                .trim()
                .parse::<f32>()
                .map_err(|_| ThermalError::invalid(field, format!("not a number: {s:?}"))),
        }
    }

    fn as_i32(&self, field: &str) -> Result<i32> {
        match self {
            Number::Num(n) => Ok(*n as i32),
            Number::Text(s) if s.trim() == "max" => Ok(i32::MAX),
            Number::Text(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|_| ThermalError::invalid(field, format!("not an integer: {s:?}"))),
        }
    }
}

fn flag(v: &Option<Value>) -> bool {
    matches!(v, Some(Value::Bool(true)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSensor {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "Type")]
    kind: String,
    #[serde(default)]
    monitor: Option<Value>,
    #[serde(default)]
    send_power_hint: Option<Value>,
    #[serde(default)]
    virtual_sensor: Option<Value>,
    #[serde(default)]
    hot_threshold: Option<Vec<Number>>,
    #[serde(default)]
    hot_hysteresis: Option<Vec<Number>>,
    #[serde(default)]
    cold_threshold: Option<Vec<Number>>,
    #[serde(default)]
    cold_hysteresis: Option<Vec<Number>>,
    #[serde(default)]
    combination: Vec<String>,
    #[serde(default)]
    coefficient: Vec<Number>,
    #[serde(default)]
    offset: Option<Number>,
    #[serde(default)]
    trigger_sensor: String,
    #[serde(default)]
    formula: String,
    #[serde(default)]
    temp_path: Option<String>,
    #[serde(default)]
    vr_threshold: Option<Number>,
    #[serde(default)]
    multiplier: Option<Number>,
    #[serde(default)]
    polling_delay: Option<Number>,
    #[serde(default)]
    passive_delay: Option<Number>,
    #[serde(default, rename = "PIDInfo")]
    pid_info: Option<RawPidInfo>,
    #[serde(default)]
    binded_cdev_info: Vec<RawBindedCdev>,
}

#[derive(Debug, Deserialize)]
struct RawPidInfo {
    #[serde(default, rename = "K_Po")]
    k_po: Option<Vec<Number>>,
    #[serde(default, rename = "K_Pu")]
    k_pu: Option<Vec<Number>>,
    #[serde(default, rename = "K_I")]
    k_i: Option<Vec<Number>>,
    #[serde(default, rename = "K_D")]
    k_d: Option<Vec<Number>>,
    #[serde(default, rename = "I_Max")]
    i_max: Option<Vec<Number>>,
    #[serde(default, rename = "MaxAllocPower")]
    max_alloc_power: Option<Vec<Number>>,
    #[serde(default, rename = "MinAllocPower")]
    min_alloc_power: Option<Vec<Number>>,
    #[serde(default, rename = "S_Power")]
    s_power: Option<Vec<Number>>,
    #[serde(default, rename = "I_Cutoff")]
    i_cutoff: Option<Vec<Number>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawBindedCdev {
    #[serde(default)]
    cdev_request: String,
    #[serde(default, rename = "CdevWeightForPID")]
    cdev_weight_for_pid: Option<Vec<Number>>,
    #[serde(default)]
    cdev_ceiling: Option<Vec<Number>>,
    #[serde(default)]
    limit_info: Option<Vec<Number>>,
    #[serde(default)]
    binded_power_rail: String,
    #[serde(default)]
    high_power_check: Option<Value>,
    #[serde(default)]
    throttling_with_power_link: Option<Value>,
    #[serde(default)]
    cdev_floor_with_power_link: Option<Vec<Number>>,
    #[serde(default)]
    power_threshold: Option<Vec<Number>>,
    #[serde(default)]
    release_logic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCoolingDevice {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "Type")]
    kind: String,
    #[serde(default)]
    read_path: String,
    #[serde(default)]
    write_path: String,
    #[serde(default)]
    state2_power: Vec<Number>,
    #[serde(default)]
    power_rail: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerRail {
    #[serde(default)]
    name: String,
    #[serde(default)]
    rail: Option<String>,
    #[serde(default)]
    virtual_rails: Option<Value>,
    #[serde(default)]
    combination: Vec<String>,
    #[serde(default)]
    coefficient: Vec<Number>,
    #[serde(default)]
    offset: Option<Number>,
    #[serde(default)]
    formula: String,
    #[serde(default)]
    power_sample_count: Option<Number>,
    #[serde(default)]
    power_sample_delay: Option<Number>,
}

// ============================================================================
// Array helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Any,
    NonDecreasing,
    NonIncreasing,
}

/// Parse a per-severity float array. NaN entries are skipped by the ordering check.
fn float_array(field: &str, values: &[Number], order: Order) -> Result<ThrottlingArray> {
    if values.len() != SEVERITY_COUNT {
        return Err(ThermalError::invalid(
            field,
            format!("expected {} entries, found {}", SEVERITY_COUNT, values.len()),
        ));
    }
    let mut out = [f32::NAN; SEVERITY_COUNT];
    let mut last = f32::NAN;
    for (i, v) in values.iter().enumerate() {
        let x = v.as_f32(field)?;
        if !x.is_nan() && !last.is_nan() {
            let bad = match order {
                Order::NonDecreasing => x < last,
                Order::NonIncreasing => x > last,
                Order::Any => false,
            };
            if bad {
                return Err(ThermalError::invalid(
                    field,
                    format!("entry [{i}] {x} breaks ordering after {last}"),
                ));
            }
        }
        if !x.is_nan() {
            last = x;
        }
        out[i] = x;
    }
    Ok(out)
}

fn int_array(field: &str, values: &[Number]) -> Result<CdevArray> {
    if values.len() != SEVERITY_COUNT {
        return Err(ThermalError::invalid(
            field,
            format!("expected {} entries, found {}", SEVERITY_COUNT, values.len()),
        ));
    }
    let mut out = [0; SEVERITY_COUNT];
    for (i, v) in values.iter().enumerate() {
        out[i] = v.as_i32(field)?;
    }
    Ok(out)
}

fn hysteresis_array(field: &str, values: Option<&Vec<Number>>) -> Result<ThrottlingArray> {
    let Some(values) = values else {
        return Ok([0.0; SEVERITY_COUNT]);
    };
    let out = float_array(field, values, Order::Any)?;
    if out.iter().any(|v| v.is_nan()) {
        return Err(ThermalError::invalid(field, "hysteresis cannot be NAN"));
    }
    Ok(out)
}

fn delay(field: &str, value: Option<&Number>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(v) => {
            let ms = v.as_i32(field)?;
            if ms < 0 {
                return Err(ThermalError::invalid(field, "negative delay"));
            }
            Ok(Duration::from_millis(ms as u64))
        }
    }
}

fn section<'a>(root: &'a Value, key: &str) -> Result<&'a [Value]> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ThermalError::invalid(key, "section must be an array")),
    }
}

// ============================================================================
// Section parsers
// ============================================================================

/// Parse the `Sensors` section.
pub fn parse_sensors(root: &Value, opts: ParseOptions) -> Result<Vec<SensorInfo>> {
    let mut names = HashSet::new();
    let mut parsed = Vec::new();

    for (i, item) in section(root, "Sensors")?.iter().enumerate() {
        let raw: RawSensor = serde_json::from_value(item.clone())?;
        if raw.name.is_empty() {
            return Err(ThermalError::MissingConfig(format!("Sensor[{i}]'s Name")));
        }
        if !names.insert(raw.name.clone()) {
            return Err(ThermalError::DuplicateName { kind: "Sensor", name: raw.name });
        }
        let sensor = parse_sensor(raw, opts)?;
        debug!(sensor = %sensor.name, monitor = sensor.is_monitor, "parsed sensor");
        parsed.push(sensor);
    }

    info!("{} Sensors parsed successfully", parsed.len());
    Ok(parsed)
}

fn parse_sensor(raw: RawSensor, opts: ParseOptions) -> Result<SensorInfo> {
    let name = raw.name;
    let field = |f: &str| format!("Sensor[{name}].{f}");
    let kind = TemperatureType::from_str(&raw.kind)?;

    let send_cb = flag(&raw.monitor);
    let send_powerhint = flag(&raw.send_power_hint);

    let hot = raw
        .hot_threshold
        .as_ref()
        .ok_or_else(|| ThermalError::MissingConfig(field("HotThreshold")))?;
    let hot_thresholds = float_array(&field("HotThreshold"), hot, Order::NonDecreasing)?;
    let hot_hysteresis = hysteresis_array(&field("HotHysteresis"), raw.hot_hysteresis.as_ref())?;
    let cold_thresholds = match raw.cold_threshold.as_ref() {
        Some(v) => float_array(&field("ColdThreshold"), v, Order::NonIncreasing)?,
        None => [f32::NAN; SEVERITY_COUNT],
    };
    let cold_hysteresis = hysteresis_array(&field("ColdHysteresis"), raw.cold_hysteresis.as_ref())?;

    let virtual_sensor = if flag(&raw.virtual_sensor) {
        if raw.combination.is_empty() || raw.coefficient.is_empty() {
            return Err(ThermalError::invalid(field("Combination"), "virtual sensor needs links and coefficients"));
        }
        if raw.combination.len() != raw.coefficient.len() {
            return Err(ThermalError::invalid(field("Coefficient"), "length differs from Combination"));
        }
        let coefficients = raw
            .coefficient
            .iter()
            .map(|c| c.as_f32(&field("Coefficient")))
            .collect::<Result<Vec<_>>>()?;
        let offset = match &raw.offset {
            Some(o) => o.as_f32(&field("Offset"))?,
            None => 0.0,
        };
        Some(VirtualSensorInfo {
            linked_sensors: raw.combination,
            linked: Vec::new(),
            coefficients,
            offset,
            trigger_sensor: raw.trigger_sensor,
            trigger: None,
            formula: Formula::from_str(&raw.formula)?,
        })
    } else {
        None
    };

    let vr_threshold = match &raw.vr_threshold {
        Some(v) => v.as_f32(&field("VrThreshold"))?,
        None => f32::NAN,
    };
    let multiplier = match &raw.multiplier {
        Some(v) => v.as_f32(&field("Multiplier"))?,
        None => 1.0,
    };
    let polling_delay = delay(&field("PollingDelay"), raw.polling_delay.as_ref(), UEVENT_POLL_TIMEOUT)?;
    let passive_delay = delay(&field("PassiveDelay"), raw.passive_delay.as_ref(), MIN_POLL_INTERVAL)?;

    let pid = match raw.pid_info {
        Some(p) => Some(parse_pid(&name, p)?),
        None => None,
    };

    let mut binded_cdevs = Vec::with_capacity(raw.binded_cdev_info.len());
    let mut requested = HashSet::new();
    for b in raw.binded_cdev_info {
        if !requested.insert(b.cdev_request.clone()) {
            return Err(ThermalError::DuplicateName { kind: "BindedCdev", name: b.cdev_request });
        }
        binded_cdevs.push(parse_binding(&name, b, pid.is_some(), opts)?);
    }
    let support_hard_limit = binded_cdevs.iter().any(|b| b.limit_provided);
    let binded_cdevs: Vec<BindedCdevInfo> = binded_cdevs.into_iter().map(|b| b.info).collect();

    let is_monitor = send_cb || send_powerhint || pid.is_some() || support_hard_limit;

    Ok(SensorInfo {
        name,
        kind,
        hot_thresholds,
        cold_thresholds,
        hot_hysteresis,
        cold_hysteresis,
        temp_path: raw.temp_path.filter(|p| !p.is_empty()).map(PathBuf::from),
        vr_threshold,
        multiplier,
        polling_delay,
        passive_delay,
        send_cb,
        send_powerhint,
        is_monitor,
        virtual_sensor,
        pid,
        binded_cdevs,
    })
}

fn parse_pid(sensor: &str, raw: RawPidInfo) -> Result<PidInfo> {
    let req = |key: &str, v: Option<Vec<Number>>, order: Order| -> Result<ThrottlingArray> {
        let field = format!("Sensor[{sensor}].PIDInfo.{key}");
        let v = v.ok_or_else(|| ThermalError::MissingConfig(field.clone()))?;
        float_array(&field, &v, order)
    };
    let pid = PidInfo {
        k_po: req("K_Po", raw.k_po, Order::Any)?,
        k_pu: req("K_Pu", raw.k_pu, Order::Any)?,
        k_i: req("K_I", raw.k_i, Order::Any)?,
        k_d: req("K_D", raw.k_d, Order::Any)?,
        i_max: req("I_Max", raw.i_max, Order::Any)?,
        max_alloc_power: req("MaxAllocPower", raw.max_alloc_power, Order::NonIncreasing)?,
        min_alloc_power: req("MinAllocPower", raw.min_alloc_power, Order::NonIncreasing)?,
        s_power: req("S_Power", raw.s_power, Order::NonIncreasing)?,
        i_cutoff: req("I_Cutoff", raw.i_cutoff, Order::Any)?,
    };
    if !pid.is_valid_combination() {
        error!(sensor, "Invalid PID parameters combinations");
        return Err(ThermalError::invalid(
            format!("Sensor[{sensor}].PIDInfo"),
            "invalid PID parameters combinations",
        ));
    }
    Ok(pid)
}

struct ParsedBinding {
    info: BindedCdevInfo,
    limit_provided: bool,
}

fn parse_binding(sensor: &str, raw: RawBindedCdev, support_pid: bool, opts: ParseOptions) -> Result<ParsedBinding> {
    let cdev = raw.cdev_request;
    let field = |f: &str| format!("Sensor[{sensor}].BindedCdevInfo[{cdev}].{f}");

    let mut cdev_weight_for_pid = [f32::NAN; SEVERITY_COUNT];
    let mut cdev_ceiling = [i32::MAX; SEVERITY_COUNT];
    if support_pid {
        if let Some(v) = &raw.cdev_weight_for_pid {
            cdev_weight_for_pid = float_array(&field("CdevWeightForPID"), v, Order::Any)?;
        }
        if let Some(v) = &raw.cdev_ceiling {
            cdev_ceiling = int_array(&field("CdevCeiling"), v)?;
        }
    }

    let mut limit_info = [0; SEVERITY_COUNT];
    let mut limit_provided = false;
    if let Some(v) = raw.limit_info.as_ref().filter(|v| !v.is_empty()) {
        limit_info = int_array(&field("LimitInfo"), v)?;
        limit_provided = true;
    }

    let mut power_rail_name = String::new();
    let mut high_power_check = false;
    let mut throttling_with_power_link = false;
    let mut cdev_floor_with_power_link = [0; SEVERITY_COUNT];
    let mut power_thresholds = [f32::NAN; SEVERITY_COUNT];
    let mut release_logic = ReleaseLogic::None;

    if !opts.power_link_disabled {
        power_rail_name = raw.binded_power_rail;
        high_power_check = flag(&raw.high_power_check);
        throttling_with_power_link = flag(&raw.throttling_with_power_link);
        if let Some(v) = raw.cdev_floor_with_power_link.as_ref().filter(|v| !v.is_empty()) {
            cdev_floor_with_power_link = int_array(&field("CdevFloorWithPowerLink"), v)?;
        }
        if let Some(v) = raw.power_threshold.as_ref().filter(|v| !v.is_empty()) {
            power_thresholds = float_array(&field("PowerThreshold"), v, Order::Any)?;
            release_logic = ReleaseLogic::from_str(&raw.release_logic)?;
        }
    }

    Ok(ParsedBinding {
        info: BindedCdevInfo {
            cdev_name: cdev,
            cdev: None,
            limit_info,
            power_thresholds,
            release_logic,
            high_power_check,
            throttling_with_power_link,
            cdev_weight_for_pid,
            cdev_ceiling,
            cdev_floor_with_power_link,
            power_rail_name,
            power_rail: None,
        },
        limit_provided,
    })
}

/// Parse the `CoolingDevices` section.
pub fn parse_cooling_devices(root: &Value) -> Result<Vec<CdevInfo>> {
    let mut names = HashSet::new();
    let mut parsed = Vec::new();

    for (i, item) in section(root, "CoolingDevices")?.iter().enumerate() {
        let raw: RawCoolingDevice = serde_json::from_value(item.clone())?;
        if raw.name.is_empty() {
            return Err(ThermalError::MissingConfig(format!("CoolingDevice[{i}]'s Name")));
        }
        if !names.insert(raw.name.clone()) {
            return Err(ThermalError::DuplicateName { kind: "CoolingDevice", name: raw.name });
        }
        let kind = CoolingType::from_str(&raw.kind)?;
        let field = format!("CoolingDevice[{}].State2Power", raw.name);
        let state2power = raw
            .state2_power
            .iter()
            .map(|v| v.as_f32(&field))
            .collect::<Result<Vec<_>>>()?;
        if state2power.is_empty() {
            debug!(cdev = %raw.name, "does not support State2Power");
        }
        let non_empty = |s: String| if s.is_empty() { None } else { Some(PathBuf::from(s)) };
        parsed.push(CdevInfo {
            name: raw.name,
            kind,
            read_path: non_empty(raw.read_path),
            write_path: non_empty(raw.write_path),
            state2power,
            power_rail: raw.power_rail,
            max_state: i32::MAX,
        });
    }

    info!("{} CoolingDevices parsed successfully", parsed.len());
    Ok(parsed)
}

/// Parse the `PowerRails` section.
pub fn parse_power_rails(root: &Value) -> Result<Vec<PowerRailInfo>> {
    let mut names = HashSet::new();
    let mut parsed = Vec::new();

    for (i, item) in section(root, "PowerRails")?.iter().enumerate() {
        let raw: RawPowerRail = serde_json::from_value(item.clone())?;
        if raw.name.is_empty() {
            return Err(ThermalError::MissingConfig(format!("PowerRail[{i}]'s Name")));
        }
        if !names.insert(raw.name.clone()) {
            return Err(ThermalError::DuplicateName { kind: "PowerRail", name: raw.name });
        }
        let field = |f: &str| format!("PowerRail[{}].{f}", raw.name);

        let virtual_power_rail = if flag(&raw.virtual_rails) {
            if raw.combination.is_empty() || raw.coefficient.is_empty() {
                return Err(ThermalError::invalid(field("Combination"), "virtual rail needs links and coefficients"));
            }
            if raw.combination.len() != raw.coefficient.len() {
                return Err(ThermalError::invalid(field("Coefficient"), "length differs from Combination"));
            }
            let coefficients = raw
                .coefficient
                .iter()
                .map(|c| c.as_f32(&field("Coefficient")))
                .collect::<Result<Vec<_>>>()?;
            let offset = match &raw.offset {
                Some(o) => o.as_f32(&field("Offset"))?,
                None => 0.0,
            };
            Some(VirtualPowerRailInfo {
                linked_power_rails: raw.combination.clone(),
                coefficients,
                offset,
                formula: Formula::from_str(&raw.formula)?,
            })
        } else {
            None
        };

        let power_sample_count = match &raw.power_sample_count {
            Some(n) => n.as_i32(&field("PowerSampleCount"))?.max(0) as usize,
            None => 0,
        };
        let power_sample_delay = delay(&field("PowerSampleDelay"), raw.power_sample_delay.as_ref(), Duration::MAX)?;

        parsed.push(PowerRailInfo {
            rail: raw.rail.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| raw.name.clone()),
            name: raw.name,
            power_sample_count,
            power_sample_delay,
            virtual_power_rail,
        });
    }

    info!("{} PowerRails parsed successfully", parsed.len());
    Ok(parsed)
}

// ============================================================================
// Whole document
// ============================================================================

/// All three sections, cross-referenced by index
#[derive(Debug, Clone)]
pub struct ThermalConfig {
    pub sensors: Vec<SensorInfo>,
    pub cdevs: Vec<CdevInfo>,
    pub power_rails: Vec<PowerRailInfo>,
    sensor_index: HashMap<String, SensorId>,
    cdev_index: HashMap<String, CdevId>,
    rail_index: HashMap<String, RailId>,
}

impl ThermalConfig {
    /// Read and parse a configuration file.
    pub fn load<P: AsRef<Path>>(path: P, opts: ParseOptions) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ThermalError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data, opts)
    }

    /// Parse a configuration document held in memory.
    pub fn parse(doc: &str, opts: ParseOptions) -> Result<Self> {
        let root: Value = serde_json::from_str(doc)?;
        let sensors = parse_sensors(&root, opts)?;
        let cdevs = parse_cooling_devices(&root)?;
        let power_rails = parse_power_rails(&root)?;
        Self::from_parts(sensors, cdevs, power_rails)
    }

    /// Build the name tables and resolve every cross reference.
    pub fn from_parts(
        sensors: Vec<SensorInfo>,
        cdevs: Vec<CdevInfo>,
        power_rails: Vec<PowerRailInfo>,
    ) -> Result<Self> {
        let sensor_index = sensors
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), SensorId(i)))
            .collect();
        let cdev_index = cdevs
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), CdevId(i)))
            .collect();
        let rail_index = power_rails
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), RailId(i)))
            .collect();
        let mut cfg = ThermalConfig {
            sensors,
            cdevs,
            power_rails,
            sensor_index,
            cdev_index,
            rail_index,
        };
        cfg.link()?;
        Ok(cfg)
    }

    fn link(&mut self) -> Result<()> {
        for idx in 0..self.sensors.len() {
            let (linked, trigger) = {
                let sensor = &self.sensors[idx];
                let Some(vs) = &sensor.virtual_sensor else { continue };
                let mut linked = Vec::with_capacity(vs.linked_sensors.len());
                for l in &vs.linked_sensors {
                    let id = self.sensor_id(l).ok_or_else(|| {
                        ThermalError::invalid(
                            format!("Sensor[{}].Combination", sensor.name),
                            format!("unknown linked sensor {l}"),
                        )
                    })?;
                    linked.push(id);
                }
                let trigger = self.sensor_id(&vs.trigger_sensor);
                if trigger.is_none() && sensor.is_monitor {
                    return Err(ThermalError::invalid(
                        format!("Sensor[{}].TriggerSensor", sensor.name),
                        format!("trigger sensor {:?} does not exist", vs.trigger_sensor),
                    ));
                }
                (linked, trigger)
            };
            if let Some(vs) = self.sensors[idx].virtual_sensor.as_mut() {
                vs.linked = linked;
                vs.trigger = trigger;
            }
        }

        self.reject_virtual_cycles()?;

        // A monitored virtual sensor keeps its trigger monitored too
        for idx in 0..self.sensors.len() {
            let trigger = match &self.sensors[idx].virtual_sensor {
                Some(vs) if self.sensors[idx].is_monitor => vs.trigger,
                _ => None,
            };
            if let Some(t) = trigger {
                self.sensors[t.0].is_monitor = true;
            }
        }

        let cdev_index = &self.cdev_index;
        let rail_index = &self.rail_index;
        for sensor in &mut self.sensors {
            for b in &mut sensor.binded_cdevs {
                b.cdev = cdev_index.get(&b.cdev_name).copied();
                if !b.power_rail_name.is_empty() {
                    b.power_rail = rail_index.get(&b.power_rail_name).copied();
                }
            }
        }
        Ok(())
    }

    fn reject_virtual_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(cfg: &ThermalConfig, id: SensorId, marks: &mut [Mark]) -> Result<()> {
            match marks[id.0] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    return Err(ThermalError::VirtualSensorCycle(cfg.sensors[id.0].name.clone()))
                }
                Mark::New => {}
            }
            marks[id.0] = Mark::Active;
            if let Some(vs) = &cfg.sensors[id.0].virtual_sensor {
                for &l in &vs.linked {
                    visit(cfg, l, marks)?;
                }
            }
            marks[id.0] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.sensors.len()];
        for i in 0..self.sensors.len() {
            visit(self, SensorId(i), &mut marks)?;
        }
        Ok(())
    }

    pub fn sensor_id(&self, name: &str) -> Option<SensorId> {
        self.sensor_index.get(name).copied()
    }

    pub fn cdev_id(&self, name: &str) -> Option<CdevId> {
        self.cdev_index.get(name).copied()
    }

    pub fn rail_id(&self, name: &str) -> Option<RailId> {
        self.rail_index.get(name).copied()
    }

    pub fn sensor(&self, id: SensorId) -> &SensorInfo {
        &self.sensors[id.0]
    }

    pub fn cdev(&self, id: CdevId) -> &CdevInfo {
        &self.cdevs[id.0]
    }

    pub fn power_rail(&self, id: RailId) -> &PowerRailInfo {
        &self.power_rails[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_utils::SAMPLE_CONFIG;
    use serde_json::json;

    fn sensor_doc(extra: Value) -> Value {
        let mut s = json!({
            "Name": "skin",
            "Type": "SKIN",
            "HotThreshold": ["NAN", "NAN", 40, 45, 50, 55, 60],
            "HotHysteresis": [0, 0, 2, 2, 2, 2, 2],
            "Multiplier": 0.001
        });
        if let (Some(obj), Some(ext)) = (s.as_object_mut(), extra.as_object()) {
            for (k, v) in ext {
                obj.insert(k.clone(), v.clone());
            }
        }
        json!({ "Sensors": [s] })
    }

    #[test]
    fn test_parse_sample_config() {
        let cfg = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        assert_eq!(cfg.sensors.len(), 4);
        assert_eq!(cfg.cdevs.len(), 2);
        assert_eq!(cfg.power_rails.len(), 2);

        let skin = cfg.sensor(cfg.sensor_id("skin").unwrap());
        assert!(skin.is_monitor);
        assert!(skin.pid.is_some());
        assert_eq!(skin.binded_cdevs.len(), 1);
        assert_eq!(skin.binded_cdevs[0].cdev, cfg.cdev_id("cpu"));
        assert_eq!(skin.polling_delay, Duration::from_millis(300_000));
    }

    #[test]
    fn test_hot_threshold_must_be_non_decreasing() {
        let doc = json!({ "Sensors": [{
            "Name": "s", "Type": "CPU",
            "HotThreshold": ["NAN", 50, "NAN", 45, 60, 70, 80]
        }]});
        let err = parse_sensors(&doc, ParseOptions::default()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_hot_threshold_wrong_length() {
        let doc = json!({ "Sensors": [{ "Name": "s", "Type": "CPU", "HotThreshold": [1, 2, 3] }]});
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_cold_threshold_must_be_non_increasing() {
        let doc = sensor_doc(json!({ "ColdThreshold": [10, 5, 8, "NAN", "NAN", "NAN", "NAN"] }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
        let doc = sensor_doc(json!({ "ColdThreshold": [10, 5, "NAN", 0, "NAN", "NAN", -10] }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_ok());
    }

    #[test]
    fn test_nan_hysteresis_rejected() {
        let doc = sensor_doc(json!({ "HotHysteresis": [0, 0, "NAN", 2, 2, 2, 2] }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_duplicate_sensor_rejects_section() {
        let doc = json!({ "Sensors": [
            { "Name": "a", "Type": "CPU", "HotThreshold": [0, 1, 2, 3, 4, 5, 6] },
            { "Name": "a", "Type": "GPU", "HotThreshold": [0, 1, 2, 3, 4, 5, 6] }
        ]});
        match parse_sensors(&doc, ParseOptions::default()) {
            Err(ThermalError::DuplicateName { kind, name }) => {
                assert_eq!(kind, "Sensor");
                assert_eq!(name, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let doc = json!({ "Sensors": [{ "Name": "a", "Type": "LAVA", "HotThreshold": [0, 1, 2, 3, 4, 5, 6] }]});
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_pid_requires_complete_levels() {
        let nan7 = json!(["NAN", "NAN", "NAN", "NAN", "NAN", "NAN", "NAN"]);
        let full = json!([1, 1, 1, 1, 1, 1, 1]);
        let mut pid = json!({
            "K_Po": full, "K_Pu": full, "K_I": full, "K_D": full,
            "I_Max": full, "MaxAllocPower": [9, 9, 9, 9, 9, 9, 9],
            "MinAllocPower": [0, 0, 0, 0, 0, 0, 0],
            "S_Power": ["NAN", "NAN", 500, 400, "NAN", "NAN", "NAN"],
            "I_Cutoff": full
        });
        let doc = sensor_doc(json!({ "PIDInfo": pid.clone() }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_ok());

        pid["I_Max"] = json!([1, 1, 1, "NAN", 1, 1, 1]);
        let doc = sensor_doc(json!({ "PIDInfo": pid.clone() }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());

        pid["I_Max"] = full.clone();
        pid["S_Power"] = nan7;
        let doc = sensor_doc(json!({ "PIDInfo": pid }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_monitor_flags_and_hard_limit() {
        let doc = sensor_doc(json!({
            "BindedCdevInfo": [{ "CdevRequest": "gpu", "LimitInfo": [0, 0, 1, 2, 3, 4, 5] }]
        }));
        let sensors = parse_sensors(&doc, ParseOptions::default()).unwrap();
        assert!(sensors[0].is_monitor);
        assert!(!sensors[0].send_cb);
        assert_eq!(sensors[0].binded_cdevs[0].cdev_ceiling, [i32::MAX; SEVERITY_COUNT]);

        let doc = sensor_doc(json!({ "Monitor": "yes" }));
        let sensors = parse_sensors(&doc, ParseOptions::default()).unwrap();
        assert!(!sensors[0].is_monitor);
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let doc = sensor_doc(json!({
            "BindedCdevInfo": [
                { "CdevRequest": "gpu", "LimitInfo": [0, 0, 1, 2, 3, 4, 5] },
                { "CdevRequest": "gpu", "LimitInfo": [0, 0, 1, 1, 1, 1, 1] }
            ]
        }));
        assert!(matches!(
            parse_sensors(&doc, ParseOptions::default()),
            Err(ThermalError::DuplicateName { kind: "BindedCdev", .. })
        ));
    }

    #[test]
    fn test_release_logic_only_checked_with_power_threshold() {
        let doc = sensor_doc(json!({
            "BindedCdevInfo": [{ "CdevRequest": "gpu", "ReleaseLogic": "BOGUS" }]
        }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_ok());

        let doc = sensor_doc(json!({
            "BindedCdevInfo": [{
                "CdevRequest": "gpu",
                "PowerThreshold": [1, 1, 1, 1, 1, 1, 1],
                "ReleaseLogic": "BOGUS"
            }]
        }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_power_link_disabled_ignores_rail() {
        let doc = sensor_doc(json!({
            "BindedCdevInfo": [{
                "CdevRequest": "gpu",
                "BindedPowerRail": "VDD_GPU",
                "PowerThreshold": [1, 1, 1, 1, 1, 1, 1],
                "ReleaseLogic": "STEPWISE"
            }]
        }));
        let opts = ParseOptions { power_link_disabled: true };
        let sensors = parse_sensors(&doc, opts).unwrap();
        let b = &sensors[0].binded_cdevs[0];
        assert!(b.power_rail_name.is_empty());
        assert_eq!(b.release_logic, ReleaseLogic::None);
    }

    #[test]
    fn test_virtual_sensor_trigger_becomes_monitored() {
        let doc = json!({ "Sensors": [
            { "Name": "a", "Type": "CPU", "HotThreshold": ["NAN", "NAN", "NAN", "NAN", "NAN", "NAN", "NAN"] },
            {
                "Name": "v", "Type": "SKIN", "VirtualSensor": true, "Monitor": true,
                "Combination": ["a"], "Coefficient": [1.0], "TriggerSensor": "a",
                "Formula": "MAXIMUM",
                "HotThreshold": ["NAN", 30, 35, 40, 45, 50, 55]
            }
        ]});
        let cfg = ThermalConfig::parse(&doc.to_string(), ParseOptions::default()).unwrap();
        let a = cfg.sensor(cfg.sensor_id("a").unwrap());
        assert!(a.is_monitor);
        let v = cfg.sensor(cfg.sensor_id("v").unwrap());
        assert_eq!(v.virtual_sensor.as_ref().unwrap().trigger, cfg.sensor_id("a"));
    }

    #[test]
    fn test_missing_trigger_for_monitored_virtual_sensor() {
        let doc = json!({ "Sensors": [
            { "Name": "a", "Type": "CPU", "HotThreshold": ["NAN", "NAN", "NAN", "NAN", "NAN", "NAN", "NAN"] },
            {
                "Name": "v", "Type": "SKIN", "VirtualSensor": true, "Monitor": true,
                "Combination": ["a"], "Coefficient": [1.0], "TriggerSensor": "ghost",
                "Formula": "MAXIMUM",
                "HotThreshold": ["NAN", 30, 35, 40, 45, 50, 55]
            }
        ]});
        assert!(ThermalConfig::parse(&doc.to_string(), ParseOptions::default()).is_err());
    }

    #[test]
    fn test_virtual_sensor_cycle_rejected() {
        let nan = json!(["NAN", "NAN", "NAN", "NAN", "NAN", "NAN", "NAN"]);
        let doc = json!({ "Sensors": [
            { "Name": "x", "Type": "CPU", "VirtualSensor": true, "Combination": ["y"],
              "Coefficient": [1], "Formula": "MAXIMUM", "HotThreshold": nan },
            { "Name": "y", "Type": "CPU", "VirtualSensor": true, "Combination": ["x"],
              "Coefficient": [1], "Formula": "MAXIMUM", "HotThreshold": nan }
        ]});
        match ThermalConfig::parse(&doc.to_string(), ParseOptions::default()) {
            Err(ThermalError::VirtualSensorCycle(_)) => {}
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_virtual_sensor_link_length_mismatch() {
        let doc = sensor_doc(json!({
            "VirtualSensor": true, "Combination": ["a", "b"], "Coefficient": [1],
            "Formula": "MAXIMUM"
        }));
        assert!(parse_sensors(&doc, ParseOptions::default()).is_err());
    }

    #[test]
    fn test_power_rail_defaults() {
        let doc = json!({ "PowerRails": [
            { "Name": "VDD_CPU" },
            { "Name": "VIRT", "Rail": "", "VirtualRails": true,
              "Combination": ["A", "B"], "Coefficient": [1, "0.5"], "Formula": "WEIGHTED_AVG",
              "PowerSampleCount": 3, "PowerSampleDelay": 1000 }
        ]});
        let rails = parse_power_rails(&doc).unwrap();
        assert_eq!(rails[0].rail, "VDD_CPU");
        assert_eq!(rails[0].power_sample_delay, Duration::MAX);
        assert_eq!(rails[0].power_sample_count, 0);
        let v = rails[1].virtual_power_rail.as_ref().unwrap();
        assert_eq!(v.coefficients, vec![1.0, 0.5]);
        assert_eq!(rails[1].power_sample_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_cooling_device_section() {
        let doc = json!({ "CoolingDevices": [
            { "Name": "cpu", "Type": "CPU", "State2Power": [3000, 2000, 1000] },
            { "Name": "cpu", "Type": "CPU" }
        ]});
        assert!(parse_cooling_devices(&doc).is_err());

        let doc = json!({ "CoolingDevices": [
            { "Name": "cpu", "Type": "CPU", "WritePath": "/tmp/w" }
        ]});
        let cdevs = parse_cooling_devices(&doc).unwrap();
        assert_eq!(cdevs[0].write_path, Some(PathBuf::from("/tmp/w")));
        assert_eq!(cdevs[0].read_path, None);
        assert_eq!(cdevs[0].max_state, i32::MAX);
    }

    #[test]
    fn test_int_array_accepts_max() {
        let vals = vec![
            Number::Text("max".into()),
            Number::Num(1.0),
            Number::Num(2.0),
            Number::Num(3.0),
            Number::Num(4.0),
            Number::Num(5.0),
            Number::Text("6".into()),
        ];
        let arr = int_array("x", &vals).unwrap();
        assert_eq!(arr[0], i32::MAX);
        assert_eq!(arr[6], 6);
    }
}
