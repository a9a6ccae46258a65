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

//! Power-rail sampler.
//!
//! Energy meters under the iio root report cumulative energy per rail. Each
//! (sensor, rail) pair keeps a fixed-length queue of samples so the average
//! power over the queue span can gate how far a cooling device request is
//! released.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thermal_error::{Result, ThermalError};
use tracing::{debug, error, info, trace};

use crate::config::{BindedCdevInfo, CdevId, PowerRailInfo, RailId, ReleaseLogic, SensorId};
use crate::constants::sysfs::{ENERGY_VALUE, IIO_DEVICE_TYPE};
use crate::formula::combine;
use crate::types::Severity;

/// One energy meter reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerSample {
    /// Cumulative energy, uWs
    pub energy_counter: i64,
    /// Meter timestamp, ms
    pub duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseStatus {
    pub release_step: i32,
    pub max_release_step: i32,
}

impl ReleaseStatus {
    pub fn new(max_release_step: i32) -> Self {
        Self { release_step: 0, max_release_step }
    }

    /// Move the step one notch according to `logic`. The step stays within
    /// `[-max_release_step, max_release_step]`.
    pub fn apply(&mut self, logic: ReleaseLogic, is_over_budget: bool) {
        let max = self.max_release_step;
        match logic {
            ReleaseLogic::Increase => {
                if is_over_budget {
                    self.release_step = 0;
                } else if self.release_step > -max {
                    self.release_step -= 1;
                }
            }
            ReleaseLogic::Decrease => {
                if is_over_budget {
                    self.release_step = 0;
                } else if self.release_step < max {
                    self.release_step += 1;
                }
            }
            ReleaseLogic::Stepwise => {
                if !is_over_budget {
                    if self.release_step < max {
                        self.release_step += 1;
                    }
                } else if self.release_step > -max {
                    self.release_step -= 1;
                }
            }
            ReleaseLogic::ReleaseToFloor => {
                self.release_step = if is_over_budget { 0 } else { max };
            }
            ReleaseLogic::None => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RailHistory {
    /// Raw rail name as printed by the energy meter
    pub rail: String,
    pub samples: VecDeque<PowerSample>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerStatus {
    pub power_history: Vec<RailHistory>,
    pub time_remaining: Duration,
    pub last_updated_avg_power: f32,
}

/// Outcome of an average power computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AveragePower {
    Value(f32),
    /// No usable baseline yet (first sample, or empty history)
    NotReady,
    /// Counter went backwards, the clock did not move, or the rail is absent
    Invalid,
}

/// Latest energy reading per rail, rebuilt on every refresh
#[derive(Debug, Clone, Default)]
pub struct EnergyTable {
    samples: HashMap<String, PowerSample>,
}

impl EnergyTable {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, rail: &str) -> bool {
        self.samples.contains_key(rail)
    }

    pub fn get(&self, rail: &str) -> Option<PowerSample> {
        self.samples.get(rail).copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Replace the table with the readings found in `content`. Unparseable
    /// lines are skipped.
    pub fn load(&mut self, content: &str) {
        self.samples.clear();
        for line in content.lines() {
            if let Some((rail, sample)) = parse_energy_line(line) {
                self.samples.insert(rail, sample);
            }
        }
    }

    /// Average power of `rail` over the span of `history`.
    ///
    /// With `power_sample_update` the oldest sample is replaced by the
    /// current reading, whatever the outcome.
    pub fn get_average_power(
        &self,
        rail: &str,
        history: &mut VecDeque<PowerSample>,
        power_sample_update: bool,
    ) -> AveragePower {
        let Some(curr) = self.get(rail) else {
            error!(rail, "power rail has no energy reading");
            return AveragePower::Invalid;
        };
        let Some(last) = history.front().copied() else {
            return AveragePower::NotReady;
        };

        let duration = curr.duration - last.duration;
        let delta_energy = curr.energy_counter - last.energy_counter;
        let result = if last.duration == 0 {
            trace!(rail, "the last energy timestamp is zero");
            AveragePower::NotReady
        } else if duration <= 0 || delta_energy < 0 {
            error!(rail, duration, delta_energy, "power rail sample is invalid");
            AveragePower::Invalid
        } else {
            let avg = delta_energy as f32 / duration as f32;
            trace!(rail, avg, duration, delta_energy, "average power");
            AveragePower::Value(avg)
        };

        if power_sample_update {
            history.pop_front();
            history.push_back(curr);
        }
        result
    }

    /// Average power of a rail, combining linked rails for a virtual rail.
    pub fn compute_average_power(
        &self,
        rail: &PowerRailInfo,
        status: &mut PowerStatus,
        power_sample_update: bool,
    ) -> AveragePower {
        let Some(virt) = &rail.virtual_power_rail else {
            return match status.power_history.first_mut() {
                Some(h) => self.get_average_power(&rail.rail, &mut h.samples, power_sample_update),
                None => AveragePower::Invalid,
            };
        };

        let mut invalid = false;
        let mut readings = Vec::with_capacity(status.power_history.len());
        let mut coefficients = Vec::with_capacity(status.power_history.len());
        for h in status.power_history.iter_mut() {
            let Some(idx) = virt.linked_power_rails.iter().position(|r| *r == h.rail) else {
                continue;
            };
            match self.get_average_power(&h.rail, &mut h.samples, power_sample_update) {
                AveragePower::Value(p) if p >= 0.0 => {
                    readings.push(p);
                    coefficients.push(virt.coefficients[idx]);
                }
                AveragePower::Invalid => invalid = true,
                _ => {}
            }
        }

        if invalid {
            return AveragePower::Invalid;
        }
        if readings.is_empty() {
            return AveragePower::NotReady;
        }
        let value = combine(virt.formula, &readings, &coefficients, 0.0);
        if value >= 0.0 {
            AveragePower::Value(value + virt.offset)
        } else {
            AveragePower::Value(value)
        }
    }
}

/// Parse one meter line, e.g. `CH3(T=358356)[S2M_VDD_CPUCL2], 761330`.
pub fn parse_energy_line(line: &str) -> Option<(String, PowerSample)> {
    let t = line.find("T=")?;
    let close = t + line[t..].find(')')?;
    let duration = line[t + 2..close].trim().parse::<i64>().ok()?;

    let open = close + line[close..].find(")[")?;
    let end = open + line[open..].find(']')?;
    let rail = line[open + 2..end].to_string();

    let comma = end + line[end..].find("],")?;
    let energy_counter = line[comma + 2..].trim().parse::<i64>().ok()?;

    Some((rail, PowerSample { energy_counter, duration }))
}

/// Inputs of one release-step update
#[derive(Debug, Clone, Copy)]
pub struct ReleaseRequest<'a> {
    pub sensor: SensorId,
    pub cdev: CdevId,
    pub severity: Severity,
    pub time_elapsed: Duration,
    pub binding: &'a BindedCdevInfo,
    pub rail: &'a PowerRailInfo,
    /// False when another binding already sampled this rail during the tick
    pub power_sample_update: bool,
    pub severity_changed: bool,
}

#[derive(Debug)]
pub struct PowerFiles {
    iio_root: PathBuf,
    energy_path_set: BTreeSet<PathBuf>,
    energy_info: EnergyTable,
    throttling_release_map: HashMap<SensorId, BTreeMap<CdevId, ReleaseStatus>>,
    power_status_map: HashMap<SensorId, BTreeMap<RailId, PowerStatus>>,
}

impl PowerFiles {
    pub fn new<P: AsRef<Path>>(iio_root: P) -> Self {
        Self {
            iio_root: iio_root.as_ref().to_path_buf(),
            energy_path_set: BTreeSet::new(),
            energy_info: EnergyTable::default(),
            throttling_release_map: HashMap::new(),
            power_status_map: HashMap::new(),
        }
    }

    /// Scan the iio root once for meters exposing energy readings.
    pub fn find_energy_source_to_watch(&mut self) -> bool {
        if !self.energy_path_set.is_empty() {
            return true;
        }

        let entries = match fs::read_dir(&self.iio_root) {
            Ok(e) => e,
            Err(e) => {
                error!(path = %self.iio_root.display(), error = %e, "Error opening directory");
                return false;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().contains(IIO_DEVICE_TYPE) {
                continue;
            }
            let path = entry.path().join(ENERGY_VALUE);
            match fs::read_to_string(&path) {
                Ok(content) if !content.trim().is_empty() => {
                    debug!(path = %path.display(), "found energy source");
                    self.energy_path_set.insert(path);
                }
                _ => {}
            }
        }

        !self.energy_path_set.is_empty()
    }

    /// Re-read every energy source and rebuild the energy table.
    pub fn update_energy_values(&mut self) -> Result<()> {
        let mut contents = String::new();
        for path in &self.energy_path_set {
            let data = fs::read_to_string(path).map_err(|source| ThermalError::FileRead {
                path: path.clone(),
                source,
            })?;
            contents.push_str(&data);
            if !data.ends_with('\n') {
                contents.push('\n');
            }
        }
        self.energy_info.load(&contents);
        Ok(())
    }

    pub fn clear_energy_info_map(&mut self) {
        self.energy_info.clear();
    }

    pub fn energy_info(&self) -> &EnergyTable {
        &self.energy_info
    }

    /// Start tracking `rail` for the (sensor, cdev) binding. Returns false
    /// when the meter reports none of the rail's inputs.
    pub fn register_power_rails_to_watch(
        &mut self,
        sensor: SensorId,
        cdev: CdevId,
        max_state: i32,
        rail_id: RailId,
        rail: &PowerRailInfo,
    ) -> bool {
        if self
            .throttling_release_map
            .get(&sensor)
            .is_some_and(|m| m.contains_key(&cdev))
        {
            return true;
        }

        if self.energy_info.is_empty() {
            if let Err(e) = self.update_energy_values() {
                error!(error = %e, "Failed to update energy info");
                return false;
            }
        }

        let queue = || VecDeque::from(vec![PowerSample::default(); rail.power_sample_count]);
        let power_history: Vec<RailHistory> = match &rail.virtual_power_rail {
            Some(v) if !v.linked_power_rails.is_empty() => v
                .linked_power_rails
                .iter()
                .filter(|r| self.energy_info.contains(r))
                .map(|r| RailHistory { rail: r.clone(), samples: queue() })
                .collect(),
            _ if self.energy_info.contains(&rail.rail) => {
                vec![RailHistory { rail: rail.rail.clone(), samples: queue() }]
            }
            _ => Vec::new(),
        };

        if power_history.is_empty() {
            return false;
        }

        self.throttling_release_map
            .entry(sensor)
            .or_default()
            .insert(cdev, ReleaseStatus::new(max_state));
        self.power_status_map
            .entry(sensor)
            .or_default()
            .entry(rail_id)
            .or_insert(PowerStatus {
                power_history,
                time_remaining: rail.power_sample_delay,
                last_updated_avg_power: f32::NAN,
            });

        info!(sensor = sensor.0, rail = %rail.name, cdev = cdev.0, "registered power rail");
        true
    }

    /// Advance the release step of one (sensor, cdev) binding.
    ///
    /// Returns true when the rail was handled this tick (sampled, or still
    /// waiting on its sample timer). Returns false when the binding is not
    /// tracked or no valid average power could be produced.
    pub fn throttling_release_update(&mut self, req: &ReleaseRequest<'_>) -> bool {
        let Some(rail_id) = req.binding.power_rail else {
            return false;
        };
        let registered = self
            .throttling_release_map
            .get(&req.sensor)
            .is_some_and(|m| m.contains_key(&req.cdev))
            && self
                .power_status_map
                .get(&req.sensor)
                .is_some_and(|m| m.contains_key(&rail_id));
        if !registered {
            return false;
        }

        let mut power_sample_update = req.power_sample_update;
        if let Some(status) = self.status_mut(req.sensor, rail_id) {
            if power_sample_update {
                if req.time_elapsed > status.time_remaining {
                    status.time_remaining = req.rail.power_sample_delay;
                } else {
                    status.time_remaining -= req.time_elapsed;
                    trace!(rail = %req.rail.name, remaining_ms = status.time_remaining.as_millis() as u64, "power sample pending");
                    if !req.severity_changed {
                        return true;
                    }
                    // Severity moved: reuse the cached average
                    power_sample_update = false;
                }
            } else if !req.severity_changed && status.time_remaining != req.rail.power_sample_delay {
                return false;
            }
        }

        if self.energy_info.is_empty() {
            if let Err(e) = self.update_energy_values() {
                error!(error = %e, "Failed to update energy values");
                self.set_release_step(req.sensor, req.cdev, |_| 0);
                return false;
            }
        }

        let sampled = {
            let energy = &self.energy_info;
            let Some(status) = self
                .power_status_map
                .get_mut(&req.sensor)
                .and_then(|m| m.get_mut(&rail_id))
            else {
                return false;
            };
            if !power_sample_update && !status.last_updated_avg_power.is_nan() {
                AveragePower::Value(status.last_updated_avg_power)
            } else {
                energy.compute_average_power(req.rail, status, power_sample_update)
            }
        };

        let with_link = req.binding.throttling_with_power_link;
        let avg_power = match sampled {
            AveragePower::Value(p) if p >= 0.0 => p,
            AveragePower::Invalid => {
                self.set_release_step(req.sensor, req.cdev, |r| if with_link { r.max_release_step } else { 0 });
                return false;
            }
            _ => {
                if with_link {
                    self.set_release_step(req.sensor, req.cdev, |r| r.max_release_step);
                }
                return true;
            }
        };
        if let Some(status) = self.status_mut(req.sensor, rail_id) {
            status.last_updated_avg_power = avg_power;
        }

        let threshold = req.binding.power_thresholds[req.severity.index()];
        let under_budget = if req.binding.high_power_check {
            avg_power > threshold
        } else {
            avg_power < threshold
        };
        let is_over_budget = !under_budget;
        info!(
            rail = %req.rail.name,
            threshold,
            avg_power,
            over_budget = is_over_budget,
            "power rail check"
        );

        if let Some(release) = self
            .throttling_release_map
            .get_mut(&req.sensor)
            .and_then(|m| m.get_mut(&req.cdev))
        {
            release.apply(req.binding.release_logic, is_over_budget);
        }
        true
    }

    /// Drop all power history of `sensor` and zero its release steps.
    pub fn set_power_data_to_default(&mut self, sensor: SensorId) {
        let (Some(releases), Some(statuses)) = (
            self.throttling_release_map.get_mut(&sensor),
            self.power_status_map.get_mut(&sensor),
        ) else {
            return;
        };

        for status in statuses.values_mut() {
            for h in status.power_history.iter_mut() {
                h.samples.iter_mut().for_each(|s| *s = PowerSample::default());
            }
            status.last_updated_avg_power = f32::NAN;
        }
        for release in releases.values_mut() {
            release.release_step = 0;
        }
    }

    pub fn release_step(&self, sensor: SensorId, cdev: CdevId) -> i32 {
        self.release_status(sensor, cdev)
            .map(|r| r.release_step)
            .unwrap_or(0)
    }

    pub fn release_status(&self, sensor: SensorId, cdev: CdevId) -> Option<ReleaseStatus> {
        self.throttling_release_map
            .get(&sensor)
            .and_then(|m| m.get(&cdev))
            .copied()
    }

    /// Power status of every sensor tracking `rail`
    pub fn power_status_for_rail(&self, rail: RailId) -> Vec<(SensorId, &PowerStatus)> {
        let mut out: Vec<(SensorId, &PowerStatus)> = self
            .power_status_map
            .iter()
            .filter_map(|(s, m)| m.get(&rail).map(|p| (*s, p)))
            .collect();
        out.sort_by_key(|(s, _)| *s);
        out
    }

    fn status_mut(&mut self, sensor: SensorId, rail: RailId) -> Option<&mut PowerStatus> {
        self.power_status_map.get_mut(&sensor).and_then(|m| m.get_mut(&rail))
    }

    fn set_release_step(&mut self, sensor: SensorId, cdev: CdevId, f: impl FnOnce(&ReleaseStatus) -> i32) {
        if let Some(r) = self
            .throttling_release_map
            .get_mut(&sensor)
            .and_then(|m| m.get_mut(&cdev))
        {
            r.release_step = f(r);
        }
    }
}
