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

//! The throttling engine.
//!
//! [`ThermalHelper`] owns the immutable configuration and the mutable
//! per-sensor and per-cooling-device status. Only the watcher thread calls
//! [`ThermalHelper::watcher_tick`]; query paths take read locks and see
//! snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::json;
use thermal_error::{Result, ThermalError};
use tracing::{debug, error, info, trace, warn};

use super::status::{CdevRequestStatus, SensorStatus};
use super::throttling::{
    merge_cdev_request, pid_power_budget, pid_target_state, request_cdev_by_power,
    request_cdev_by_severity, severity_from_thresholds,
};
use crate::config::{CdevId, SensorId, SensorInfo, ThermalConfig};
use crate::constants::sysfs::{
    COOLING_DEVICE_PREFIX, CUR_STATE, MAX_STATE, POLICY_FILE, SENSOR_PREFIX, STATE2POWER_TABLE,
    TEMP_FILE, TRIP_POINT_0_HYST, TRIP_POINT_0_TEMP, TYPE_FILE, USER_SPACE_POLICY, WRITE_SUFFIX,
};
use crate::constants::timing::MIN_POLL_INTERVAL;
use crate::cpu;
use crate::files::{read_trimmed, ThermalFiles};
use crate::formula::combine;
use crate::logger;
use crate::power::{PowerFiles, ReleaseRequest};
use crate::power_hint::PowerHalClient;
use crate::settings::Settings;
use crate::types::{
    CoolingDevice, CoolingType, CpuUsage, Severity, Temperature, TemperatureThreshold,
    TemperatureType, TemperatureV1, SEVERITY_COUNT,
};

/// Called with every temperature whose severity changed
pub type NotificationCallback = Box<dyn Fn(&Temperature) + Send + Sync>;

/// Highest supported hint severity for each actual severity
pub type SupportedHints = [Severity; SEVERITY_COUNT];

fn parse_value<T: FromStr>(name: &str, data: &str) -> Result<T> {
    data.trim().parse::<T>().map_err(|_| ThermalError::InvalidReading {
        name: name.to_string(),
        value: data.to_string(),
    })
}

/// Map each `<prefix>*` directory under `root` by the name in its `type`
/// file. When two directories report the same name the first one (in
/// directory-name order) wins.
pub fn parse_thermal_path_map(root: &Path, prefix: &str) -> BTreeMap<String, PathBuf> {
    let mut map = BTreeMap::new();
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot scan thermal root");
            return map;
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        match read_trimmed(dir.join(TYPE_FILE)) {
            Ok(name) => {
                map.entry(name).or_insert(dir);
            }
            Err(e) => error!(error = %e, "Failed to read thermal type"),
        }
    }
    map
}

pub struct ThermalHelper {
    config: ThermalConfig,
    thermal_sensors: ThermalFiles,
    cooling_devices: ThermalFiles,
    sensor_status: RwLock<Vec<SensorStatus>>,
    cdev_status: RwLock<Vec<CdevRequestStatus>>,
    power_files: Mutex<PowerFiles>,
    supported_powerhint: HashMap<SensorId, SupportedHints>,
    power_hal: PowerHalClient,
    cb: NotificationCallback,
    watched_sensors: BTreeSet<String>,
    throttling_disabled: bool,
    proc_stat: PathBuf,
    cpu_root: PathBuf,
}

impl ThermalHelper {
    /// Probe sysfs, validate bindings against it and prepare the status
    /// tables. Fails when a physical sensor has no readable location.
    pub fn new(
        mut config: ThermalConfig,
        settings: &Settings,
        cb: NotificationCallback,
        power_hal: PowerHalClient,
    ) -> Result<Self> {
        let tz_map = parse_thermal_path_map(&settings.thermal_root, SENSOR_PREFIX);
        let cdev_map = parse_thermal_path_map(&settings.thermal_root, COOLING_DEVICE_PREFIX);
        debug!(zones = tz_map.len(), cdevs = cdev_map.len(), "scanned thermal root");

        let thermal_sensors = initialize_sensor_map(&config, &tz_map)?;
        let cooling_devices = initialize_cooling_devices(&mut config, &cdev_map);

        let mut power_files = PowerFiles::new(&settings.iio_root);
        let mut sensor_status = vec![SensorStatus::default(); config.sensors.len()];
        let mut cdev_status = vec![CdevRequestStatus::new(); config.cdevs.len()];

        for idx in 0..config.sensors.len() {
            let id = SensorId(idx);
            let status = &mut sensor_status[idx];
            let sensor = &mut config.sensors[idx];
            let mut invalid_binded_cdev = false;

            for b in sensor.binded_cdevs.iter_mut() {
                let Some(cdev) = b.cdev else {
                    error!(sensor = %sensor.name, cdev = %b.cdev_name, "Could not find cdev in cooling device info map");
                    invalid_binded_cdev = true;
                    continue;
                };

                if b.has_pid_weight() {
                    status.pid_request_map.insert(cdev, 0);
                    cdev_status[cdev.0].insert(id, 0);
                }
                if b.has_hard_limit() {
                    status.hard_limit_request_map.insert(cdev, 0);
                    cdev_status[cdev.0].insert(id, 0);
                }

                let max_state = config.cdevs[cdev.0].max_state;
                for ceiling in b.cdev_ceiling.iter_mut() {
                    if *ceiling > max_state {
                        if *ceiling != i32::MAX {
                            error!(
                                sensor = %sensor.name,
                                cdev = %b.cdev_name,
                                ceiling = *ceiling,
                                max_state,
                                "cdev_ceiling is higher than max state"
                            );
                        }
                        *ceiling = max_state;
                    }
                }

                if b.power_rail_name.is_empty() {
                    continue;
                }
                let Some(rail_id) = b.power_rail else {
                    error!(sensor = %sensor.name, rail = %b.power_rail_name, "Unknown power rail");
                    invalid_binded_cdev = true;
                    continue;
                };
                let rail = &config.power_rails[rail_id.0];
                if rail.power_sample_count > 0
                    && power_files.find_energy_source_to_watch()
                    && !power_files.register_power_rails_to_watch(id, cdev, max_state, rail_id, rail)
                {
                    error!(
                        cdev = %b.cdev_name,
                        rail = %b.power_rail_name,
                        "Could not find power energy source"
                    );
                    invalid_binded_cdev = true;
                }
            }

            if invalid_binded_cdev {
                warn!(sensor = %sensor.name, "dropping all cooling device bindings");
                sensor.binded_cdevs.clear();
                status.pid_request_map.clear();
                status.hard_limit_request_map.clear();
                for requests in cdev_status.iter_mut() {
                    requests.remove(&id);
                }
            }
        }

        let mut helper = ThermalHelper {
            config,
            thermal_sensors,
            cooling_devices,
            sensor_status: RwLock::new(sensor_status),
            cdev_status: RwLock::new(cdev_status),
            power_files: Mutex::new(power_files),
            supported_powerhint: HashMap::new(),
            power_hal,
            cb,
            watched_sensors: BTreeSet::new(),
            throttling_disabled: settings.disable_thermal_control,
            proc_stat: settings.proc_stat.clone(),
            cpu_root: settings.cpu_root.clone(),
        };

        if helper.throttling_disabled {
            info!("thermal control is disabled");
            for cdev in &helper.config.cdevs {
                match helper.cooling_devices.write_cdev_file(&cdev.name, "0") {
                    Ok(()) => info!(cdev = %cdev.name, "Successfully clear cdev to 0"),
                    Err(e) => warn!(cdev = %cdev.name, error = %e, "failed to clear cdev"),
                }
            }
            return Ok(helper);
        }

        helper.watched_sensors = initialize_trip(&mut helper.config, &tz_map);

        if helper.power_hal.connect() {
            helper.update_supported_power_hints();
        } else {
            info!("power hint service not available");
        }

        Ok(helper)
    }

    fn update_supported_power_hints(&mut self) {
        for (idx, sensor) in self.config.sensors.iter().enumerate() {
            if !sensor.send_powerhint {
                continue;
            }
            let mut supported = [Severity::None; SEVERITY_COUNT];
            let mut current = Severity::None;
            for severity in &Severity::ALL[1..] {
                if self.power_hal.is_mode_supported(&sensor.name, *severity) {
                    current = *severity;
                }
                supported[severity.index()] = current;
            }
            self.supported_powerhint.insert(SensorId(idx), supported);
        }
    }

    pub fn config(&self) -> &ThermalConfig {
        &self.config
    }

    pub fn is_throttling_disabled(&self) -> bool {
        self.throttling_disabled
    }

    /// Sensors whose zones raise uevents on trip crossings
    pub fn watched_sensors(&self) -> &BTreeSet<String> {
        &self.watched_sensors
    }

    pub fn power_hal(&self) -> &PowerHalClient {
        &self.power_hal
    }

    pub fn supported_power_hints(&self, id: SensorId) -> Option<&SupportedHints> {
        self.supported_powerhint.get(&id)
    }

    pub fn sensor_status(&self, id: SensorId) -> SensorStatus {
        self.sensor_status.read()[id.0].clone()
    }

    pub fn sensor_statuses(&self) -> Vec<SensorStatus> {
        self.sensor_status.read().clone()
    }

    pub fn cdev_statuses(&self) -> Vec<CdevRequestStatus> {
        self.cdev_status.read().clone()
    }

    pub fn power_files(&self) -> MutexGuard<'_, PowerFiles> {
        self.power_files.lock()
    }

    fn raw_reading(&self, id: SensorId) -> Result<f32> {
        let sensor = self.config.sensor(id);
        if sensor.is_virtual() {
            return self.check_virtual_sensor(id);
        }
        let data = self.thermal_sensors.read_file(&sensor.name)?;
        parse_value(&sensor.name, &data)
    }

    /// Read and classify a sensor. Returns the temperature and the separate
    /// (hot, cold) severities; both are NONE for unmonitored sensors.
    pub fn read_temperature(&self, id: SensorId) -> Result<(Temperature, (Severity, Severity))> {
        let sensor = self.config.sensor(id);
        let value = self.raw_reading(id)? * sensor.multiplier;

        let mut status = (Severity::None, Severity::None);
        if sensor.is_monitor {
            let (prev_hot, prev_cold) = {
                let statuses = self.sensor_status.read();
                (statuses[id.0].prev_hot_severity, statuses[id.0].prev_cold_severity)
            };
            status = severity_from_thresholds(
                &sensor.hot_thresholds,
                &sensor.cold_thresholds,
                &sensor.hot_hysteresis,
                &sensor.cold_hysteresis,
                prev_hot,
                prev_cold,
                value,
            );
        }

        let temp = Temperature {
            kind: sensor.kind,
            name: sensor.name.clone(),
            value,
            throttling_status: status.0.max(status.1),
        };
        Ok((temp, status))
    }

    /// Legacy reading with fixed throttling and shutdown thresholds
    pub fn read_temperature_v1(&self, id: SensorId) -> Result<TemperatureV1> {
        let sensor = self.config.sensor(id);
        let value = self.raw_reading(id)? * sensor.multiplier;
        Ok(TemperatureV1 {
            kind: sensor.kind.legacy(),
            name: sensor.name.clone(),
            current_value: value,
            throttling_threshold: sensor.hot_thresholds[Severity::Severe.index()],
            shutdown_threshold: sensor.hot_thresholds[Severity::Shutdown.index()],
            vr_throttling_threshold: sensor.vr_threshold,
        })
    }

    pub fn read_temperature_threshold(&self, id: SensorId) -> TemperatureThreshold {
        let sensor = self.config.sensor(id);
        TemperatureThreshold {
            kind: sensor.kind,
            name: sensor.name.clone(),
            hot_thresholds: sensor.hot_thresholds,
            cold_thresholds: sensor.cold_thresholds,
            vr_threshold: sensor.vr_threshold,
        }
    }

    pub fn read_cooling_device(&self, id: CdevId) -> Result<CoolingDevice> {
        let cdev = self.config.cdev(id);
        let data = self.cooling_devices.read_file(&cdev.name)?;
        Ok(CoolingDevice {
            kind: cdev.kind,
            name: cdev.name.clone(),
            value: parse_value(&cdev.name, &data)?,
        })
    }

    /// Combined raw value of a virtual sensor.
    ///
    /// Unreadable physical links are skipped. A failing virtual link or a NaN
    /// coefficient fails the whole evaluation. Linked readings are combined
    /// raw; the caller applies this sensor's multiplier.
    pub fn check_virtual_sensor(&self, id: SensorId) -> Result<f32> {
        let sensor = self.config.sensor(id);
        let Some(vs) = &sensor.virtual_sensor else {
            return Err(ThermalError::VirtualSensor(sensor.name.clone()));
        };

        let mut readings = Vec::with_capacity(vs.linked.len());
        let mut coefficients = Vec::with_capacity(vs.linked.len());
        for (i, &linked) in vs.linked.iter().enumerate() {
            let linked_info = self.config.sensor(linked);
            let reading = if linked_info.is_virtual() {
                self.check_virtual_sensor(linked)?
            } else {
                match self.thermal_sensors.read_file(&linked_info.name) {
                    Ok(data) => parse_value(&linked_info.name, &data)?,
                    Err(e) => {
                        debug!(sensor = %sensor.name, linked = %linked_info.name, error = %e, "skipping unreadable linked sensor");
                        continue;
                    }
                }
            };
            trace!(sensor = %sensor.name, linked = %linked_info.name, reading, "linked sensor");

            let coefficient = vs.coefficients[i];
            if coefficient.is_nan() {
                return Err(ThermalError::VirtualSensor(sensor.name.clone()));
            }
            readings.push(reading);
            coefficients.push(coefficient);
        }

        Ok(combine(vs.formula, &readings, &coefficients, vs.offset))
    }

    /// Fold one sensor's PID and hard-limit requests into the per-cdev request
    /// table. Cooling devices whose aggregate state changed are added to
    /// `to_update`.
    pub fn compute_cooling_devices_request(
        &self,
        id: SensorId,
        status: &SensorStatus,
        to_update: &mut BTreeSet<CdevId>,
    ) {
        let sensor = self.config.sensor(id);
        let severity = status.severity.index();

        let release_steps: Vec<i32> = {
            let power_files = self.power_files.lock();
            sensor
                .binded_cdevs
                .iter()
                .map(|b| b.cdev.map_or(0, |c| power_files.release_step(id, c)))
                .collect()
        };

        let mut cdev_status = self.cdev_status.write();
        for (b, release_step) in sensor.binded_cdevs.iter().zip(release_steps) {
            let Some(cdev) = b.cdev else { continue };
            let requests = &mut cdev_status[cdev.0];
            if !requests.contains_key(&id) {
                continue;
            }

            let pid_request = status.pid_request_map.get(&cdev).copied().unwrap_or(0);
            let hard_limit_request = status.hard_limit_request_map.get(&cdev).copied().unwrap_or(0);
            let floor = b.cdev_floor_with_power_link[severity];
            let ceiling = b.cdev_ceiling[severity];
            trace!(
                sensor = %sensor.name,
                cdev = %b.cdev_name,
                pid_request,
                hard_limit_request,
                release_step,
                floor,
                ceiling,
                "cdev request inputs"
            );

            let request_state =
                merge_cdev_request(pid_request, hard_limit_request, release_step, floor, ceiling);
            if requests.get(&id) == Some(&request_state) {
                continue;
            }

            let before = aggregate_state(requests);
            requests.insert(id, request_state);
            info!(sensor = %sensor.name, cdev = %b.cdev_name, state = request_state, "Sensor request");
            if aggregate_state(requests) != before {
                to_update.insert(cdev);
            }
        }
    }

    /// Write the highest requested state of each cooling device.
    pub fn update_cooling_devices(&self, to_update: &BTreeSet<CdevId>) {
        let cdev_status = self.cdev_status.read();
        for &cdev in to_update {
            let name = &self.config.cdev(cdev).name;
            let state = aggregate_state(&cdev_status[cdev.0]);
            match self.cooling_devices.write_cdev_file(name, &state.to_string()) {
                Ok(()) => {
                    debug!(cdev = %name, state, "Successfully update cdev");
                    logger::log_event("cdev_write", json!({ "cdev": name, "state": state }));
                }
                Err(e) => error!(cdev = %name, state, error = %e, "failed to update cdev"),
            }
        }
    }

    /// One pass over every monitored sensor.
    ///
    /// `uevent_sensors` names the zones the kernel reported since the last
    /// pass. Returns how long the watcher may sleep before the next pass.
    pub fn watcher_tick(&self, uevent_sensors: &BTreeSet<String>, now: Instant) -> Duration {
        let mut temps = Vec::new();
        let mut cdevs_to_update = BTreeSet::new();
        let mut updated_power_rails = BTreeSet::new();
        let mut min_sleep = Duration::MAX;

        for (idx, sensor) in self.config.sensors.iter().enumerate() {
            if !sensor.is_monitor {
                continue;
            }
            let id = SensorId(idx);
            let mut status = self.sensor_status.read()[idx].clone();
            let mut sleep = poll_delay(sensor, status.severity);
            let mut time_elapsed = Duration::ZERO;

            let force_update = match status.last_update_time {
                None => {
                    trace!(sensor = %sensor.name, "Force update after booting");
                    true
                }
                Some(last) => {
                    time_elapsed = now.saturating_duration_since(last);
                    let event_name = match &sensor.virtual_sensor {
                        Some(vs) => vs.trigger_sensor.as_str(),
                        None => sensor.name.as_str(),
                    };
                    if time_elapsed > sleep {
                        true
                    } else if uevent_sensors.contains(event_name) {
                        true
                    } else if let Some(trigger) = sensor.virtual_sensor.as_ref().and_then(|v| v.trigger) {
                        self.sensor_status.read()[trigger.0].severity != Severity::None
                    } else {
                        false
                    }
                }
            };
            trace!(
                sensor = %sensor.name,
                elapsed_ms = time_elapsed.as_millis() as u64,
                sleep_ms = sleep.as_millis() as u64,
                force_update,
                "watcher check"
            );

            if !force_update {
                min_sleep = min_sleep.min(sleep.saturating_sub(time_elapsed));
                continue;
            }

            let (temp, (hot, cold)) = match self.read_temperature(id) {
                Ok(r) => r,
                Err(e) => {
                    error!(sensor = %sensor.name, error = %e, "error reading temperature");
                    continue;
                }
            };

            status.prev_hot_severity = hot;
            status.prev_cold_severity = cold;
            let mut severity_changed = false;
            if temp.throttling_status != status.severity {
                severity_changed = true;
                info!(
                    sensor = %sensor.name,
                    from = %status.severity,
                    to = %temp.throttling_status,
                    value = temp.value,
                    "severity changed"
                );
                logger::log_event(
                    "severity_changed",
                    json!({
                        "sensor": sensor.name,
                        "value": temp.value,
                        "from": status.severity.as_str(),
                        "to": temp.throttling_status.as_str(),
                    }),
                );
                status.severity = temp.throttling_status;
                sleep = poll_delay(sensor, status.severity);
                temps.push(temp.clone());
            }

            if status.severity != Severity::None {
                info!("{}: {} degC", temp.name, temp.value);
            } else {
                trace!("{}: {} degC", temp.name, temp.value);
            }

            if !status.pid_request_map.is_empty() {
                if let Some(pid) = &sensor.pid {
                    let target_state = pid_target_state(pid, status.severity);
                    let budget = pid_power_budget(
                        pid,
                        &sensor.hot_thresholds,
                        temp.value,
                        status.severity,
                        target_state,
                        time_elapsed,
                        &mut status.err_integral,
                        &mut status.prev_err,
                    );
                    if let Err(e) = request_cdev_by_power(
                        &sensor.binded_cdevs,
                        &self.config.cdevs,
                        budget,
                        target_state,
                        &mut status.pid_request_map,
                    ) {
                        error!(sensor = %sensor.name, error = %e, "PID request cdev failed");
                    }
                }
            }

            if !status.hard_limit_request_map.is_empty() {
                request_cdev_by_severity(&sensor.binded_cdevs, status.severity, &mut status.hard_limit_request_map);
            }

            if status.requests_cdevs() {
                if status.severity == Severity::None {
                    self.power_files.lock().set_power_data_to_default(id);
                } else {
                    let mut power_files = self.power_files.lock();
                    for b in &sensor.binded_cdevs {
                        let (Some(rail_id), Some(cdev)) = (b.power_rail, b.cdev) else { continue };
                        let req = ReleaseRequest {
                            sensor: id,
                            cdev,
                            severity: status.severity,
                            time_elapsed,
                            binding: b,
                            rail: self.config.power_rail(rail_id),
                            power_sample_update: !updated_power_rails.contains(&rail_id),
                            severity_changed,
                        };
                        if power_files.throttling_release_update(&req) {
                            updated_power_rails.insert(rail_id);
                        }
                    }
                }
                self.compute_cooling_devices_request(id, &status, &mut cdevs_to_update);
            }

            min_sleep = min_sleep.min(sleep);
            trace!(
                sensor = %sensor.name,
                sleep_ms = sleep.as_millis() as u64,
                min_sleep_ms = min_sleep.as_millis() as u64,
                "sleep vote"
            );
            status.last_update_time = Some(now);
            self.sensor_status.write()[idx] = status;
        }

        if !cdevs_to_update.is_empty() {
            self.update_cooling_devices(&cdevs_to_update);
        }

        for t in &temps {
            let Some(id) = self.config.sensor_id(&t.name) else { continue };
            let sensor = self.config.sensor(id);
            if sensor.send_cb {
                (self.cb)(t);
            }
            if sensor.send_powerhint && self.power_hal.exists() {
                self.send_power_ext_hint(t);
            }
        }

        self.power_files.lock().clear_energy_info_map();
        min_sleep.max(MIN_POLL_INTERVAL)
    }

    /// Forward a severity transition as power modes: the previous hint is
    /// disabled before the new one is enabled, and nothing is sent when the
    /// supported hint level did not change.
    pub fn send_power_ext_hint(&self, t: &Temperature) {
        let Some(id) = self.config.sensor_id(&t.name) else { return };
        let current = self
            .supported_powerhint
            .get(&id)
            .map_or(Severity::None, |s| s[t.throttling_status.index()]);

        let mut statuses = self.sensor_status.write();
        let prev = statuses[id.0].prev_hint_severity;
        if prev == current {
            return;
        }
        if prev != Severity::None {
            self.power_hal.set_mode(&t.name, prev, false);
        }
        if current != Severity::None {
            self.power_hal.set_mode(&t.name, current, true);
        }
        statuses[id.0].prev_hint_severity = current;
    }

    /// Legacy listing of every sensor. Fails if any sensor cannot be read.
    pub fn fill_temperatures(&self) -> Result<Vec<TemperatureV1>> {
        (0..self.config.sensors.len())
            .map(|i| self.read_temperature_v1(SensorId(i)))
            .collect()
    }

    pub fn fill_current_temperatures(&self, filter: Option<TemperatureType>) -> Result<Vec<Temperature>> {
        let mut out = Vec::new();
        for (i, sensor) in self.config.sensors.iter().enumerate() {
            if filter.is_some_and(|t| t != sensor.kind) {
                continue;
            }
            let (temp, _) = self.read_temperature(SensorId(i)).map_err(|e| {
                error!(sensor = %sensor.name, error = %e, "error reading temperature");
                e
            })?;
            out.push(temp);
        }
        Ok(out)
    }

    pub fn fill_temperature_thresholds(&self, filter: Option<TemperatureType>) -> Vec<TemperatureThreshold> {
        self.config
            .sensors
            .iter()
            .enumerate()
            .filter(|(_, s)| filter.map_or(true, |t| t == s.kind))
            .map(|(i, _)| self.read_temperature_threshold(SensorId(i)))
            .collect()
    }

    pub fn fill_current_cooling_devices(&self, filter: Option<CoolingType>) -> Result<Vec<CoolingDevice>> {
        let mut out = Vec::new();
        for (i, cdev) in self.config.cdevs.iter().enumerate() {
            if filter.is_some_and(|t| t != cdev.kind) {
                continue;
            }
            let device = self.read_cooling_device(CdevId(i)).map_err(|e| {
                error!(cdev = %cdev.name, error = %e, "error reading cooling device");
                e
            })?;
            out.push(device);
        }
        Ok(out)
    }

    pub fn fill_cpu_usages(&self) -> Vec<CpuUsage> {
        cpu::cpu_usages(&self.proc_stat, &self.cpu_root)
    }
}

fn poll_delay(sensor: &SensorInfo, severity: Severity) -> Duration {
    if severity != Severity::None {
        sensor.passive_delay
    } else {
        sensor.polling_delay
    }
}

fn aggregate_state(requests: &CdevRequestStatus) -> i32 {
    requests.values().copied().fold(0, i32::max)
}

fn initialize_sensor_map(config: &ThermalConfig, tz_map: &BTreeMap<String, PathBuf>) -> Result<ThermalFiles> {
    let mut files = ThermalFiles::new();
    for sensor in &config.sensors {
        if sensor.is_virtual() {
            continue;
        }
        let path = match (&sensor.temp_path, tz_map.get(&sensor.name)) {
            (Some(p), _) => p.clone(),
            (None, Some(dir)) => dir.join(TEMP_FILE),
            (None, None) => {
                return Err(ThermalError::init(format!("Could not find {} in sysfs", sensor.name)));
            }
        };
        files.add_file(&sensor.name, path);
    }
    Ok(files)
}

fn initialize_cooling_devices(config: &mut ThermalConfig, cdev_map: &BTreeMap<String, PathBuf>) -> ThermalFiles {
    let mut files = ThermalFiles::new();
    for cdev in config.cdevs.iter_mut() {
        let Some(dir) = cdev_map.get(&cdev.name) else {
            error!(cdev = %cdev.name, "Could not find cooling device in sysfs");
            continue;
        };

        let read_path = cdev.read_path.clone().unwrap_or_else(|| dir.join(CUR_STATE));
        files.add_file(&cdev.name, read_path);

        if let Ok(table) = fs::read_to_string(dir.join(STATE2POWER_TABLE)) {
            info!(cdev = %cdev.name, "use state2power read from sysfs");
            cdev.state2power = table
                .split_whitespace()
                .map_while(|w| w.parse::<u32>().ok())
                .map(|p| p as f32)
                .collect();
        }

        match read_trimmed(dir.join(MAX_STATE)).and_then(|d| parse_value::<i32>(&cdev.name, &d)) {
            Ok(max_state) => {
                cdev.max_state = max_state;
                info!(cdev = %cdev.name, max_state, states = cdev.state2power.len(), "cooling device probed");
                if !cdev.state2power.is_empty() && cdev.state2power.len() as i64 != max_state as i64 + 1 {
                    error!(
                        cdev = %cdev.name,
                        found = cdev.state2power.len(),
                        expected = max_state as i64 + 1,
                        "Invalid state2power number"
                    );
                }
            }
            Err(e) => {
                error!(cdev = %cdev.name, error = %e, "could not open max state file");
                cdev.max_state = i32::MAX;
            }
        }

        let write_path = cdev.write_path.clone().unwrap_or_else(|| dir.join(CUR_STATE));
        files.add_file(format!("{}{WRITE_SUFFIX}", cdev.name), write_path);
    }

    if config.cdevs.len() * 2 != files.len() {
        error!("Some cooling device can not be initialized");
    }
    files
}

/// Program trip point 0 of every monitored zone that accepts user-space
/// policy and return those zones. Sensors that cannot rely on uevents fall
/// back to the minimum poll interval.
fn initialize_trip(config: &mut ThermalConfig, tz_map: &BTreeMap<String, PathBuf>) -> BTreeSet<String> {
    let mut monitored = BTreeSet::new();
    for sensor in config.sensors.iter_mut() {
        if !sensor.is_monitor || sensor.is_virtual() {
            continue;
        }

        let trip_update = match tz_map.get(&sensor.name) {
            None => {
                warn!(sensor = %sensor.name, "no thermal zone for trip point");
                false
            }
            Some(dir) => match read_trimmed(dir.join(POLICY_FILE)) {
                Err(e) => {
                    error!(sensor = %sensor.name, error = %e, "could not open tz policy file");
                    false
                }
                Ok(policy) if policy != USER_SPACE_POLICY => {
                    error!(sensor = %sensor.name, policy = %policy, "does not support uevent notify");
                    false
                }
                Ok(_) => {
                    monitored.insert(sensor.name.clone());
                    write_trip_point(sensor, dir)
                }
            },
        };

        if !trip_update {
            info!(
                sensor = %sensor.name,
                interval_ms = MIN_POLL_INTERVAL.as_millis() as u64,
                "config sensor to default polling interval"
            );
            sensor.polling_delay = MIN_POLL_INTERVAL;
            sensor.passive_delay = MIN_POLL_INTERVAL;
        }
    }
    monitored
}

fn write_trip_point(sensor: &SensorInfo, dir: &Path) -> bool {
    let Some(i) = (0..SEVERITY_COUNT)
        .find(|&i| !sensor.hot_thresholds[i].is_nan() && !sensor.hot_hysteresis[i].is_nan())
    else {
        error!(sensor = %sensor.name, "all thresholds are NAN");
        return false;
    };

    let temp = ((sensor.hot_thresholds[i] / sensor.multiplier).round() as i32).to_string();
    let hyst = ((sensor.hot_hysteresis[i] / sensor.multiplier).round() as i32).to_string();
    for (file, value) in [(TRIP_POINT_0_TEMP, temp), (TRIP_POINT_0_HYST, hyst)] {
        let path = dir.join(file);
        if let Err(e) = fs::write(&path, &value) {
            error!(sensor = %sensor.name, path = %path.display(), value = %value, error = %e, "fail to update trip point");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParseOptions;
    use crate::power_hint::MockPowerHintService;
    use crate::test_utils::test_utils::{FakeSysfs, SAMPLE_CONFIG};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn no_cb() -> NotificationCallback {
        Box::new(|_| {})
    }

    fn sample_helper(sysfs: &FakeSysfs) -> ThermalHelper {
        let config = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        ThermalHelper::new(config, &sysfs.settings(), no_cb(), PowerHalClient::disconnected()).unwrap()
    }

    #[test]
    fn test_path_map_first_zone_wins() {
        let sysfs = FakeSysfs::new();
        let first = sysfs.add_zone(1, "skin", "30000", None);
        sysfs.add_zone(7, "skin", "99000", None);
        sysfs.add_zone(2, "battery", "25000", None);

        let map = parse_thermal_path_map(&sysfs.thermal_root(), SENSOR_PREFIX);
        assert_eq!(map.len(), 2);
        assert_eq!(map["skin"], first);
    }

    #[test]
    fn test_missing_zone_fails_init() {
        let sysfs = FakeSysfs::new();
        let config = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        let result = ThermalHelper::new(config, &sysfs.settings(), no_cb(), PowerHalClient::disconnected());
        assert!(matches!(result, Err(ThermalError::Init(_))));
    }

    #[test]
    fn test_trip_point_programmed_for_user_space_zone() {
        let sysfs = FakeSysfs::sample();
        let helper = sample_helper(&sysfs);

        let skin_dir = sysfs.zone_dir("skin");
        assert_eq!(fs::read_to_string(skin_dir.join(TRIP_POINT_0_TEMP)).unwrap(), "40000");
        assert_eq!(fs::read_to_string(skin_dir.join(TRIP_POINT_0_HYST)).unwrap(), "2000");
        assert!(helper.watched_sensors().contains("skin"));

        // cpu0 zone uses step_wise, so it is polled instead
        let cpu0 = helper.config().sensor(helper.config().sensor_id("cpu0").unwrap());
        assert_eq!(cpu0.polling_delay, MIN_POLL_INTERVAL);
        assert_eq!(cpu0.passive_delay, MIN_POLL_INTERVAL);
        assert!(!helper.watched_sensors().contains("cpu0"));
    }

    #[test]
    fn test_cdev_probe_reads_sysfs_tables() {
        let sysfs = FakeSysfs::sample();
        fs::write(sysfs.cdev_dir("cpu").join(STATE2POWER_TABLE), "4000 3000 2000 1000 500\n").unwrap();
        let helper = sample_helper(&sysfs);
        let cpu = helper.config().cdev(helper.config().cdev_id("cpu").unwrap());
        assert_eq!(cpu.max_state, 4);
        assert_eq!(cpu.state2power, vec![4000.0, 3000.0, 2000.0, 1000.0, 500.0]);
    }

    #[test]
    fn test_read_temperature_applies_multiplier() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("skin", "41000");
        let helper = sample_helper(&sysfs);

        let (temp, (hot, cold)) = helper.read_temperature(helper.config().sensor_id("skin").unwrap()).unwrap();
        assert!((temp.value - 41.0).abs() < 1e-4);
        assert_eq!(hot, Severity::Moderate);
        assert_eq!(cold, Severity::None);
        assert_eq!(temp.throttling_status, Severity::Moderate);
    }

    #[test]
    fn test_unmonitored_sensor_reports_none() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("battery", "70000");
        let helper = sample_helper(&sysfs);
        let (temp, _) = helper.read_temperature(helper.config().sensor_id("battery").unwrap()).unwrap();
        assert_eq!(temp.throttling_status, Severity::None);
    }

    #[test]
    fn test_virtual_sensor_weighted_average() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("cpu0", "50000");
        sysfs.set_temp("skin", "30000");
        let helper = sample_helper(&sysfs);

        let id = helper.config().sensor_id("virt_skin").unwrap();
        assert_eq!(helper.check_virtual_sensor(id).unwrap(), 40000.0);
        let (temp, _) = helper.read_temperature(id).unwrap();
        assert!((temp.value - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_virtual_sensor_skips_unreadable_link() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("skin", "30000");
        fs::remove_file(sysfs.zone_dir("cpu0").join(TEMP_FILE)).unwrap();
        let helper = sample_helper(&sysfs);

        let id = helper.config().sensor_id("virt_skin").unwrap();
        assert_eq!(helper.check_virtual_sensor(id).unwrap(), 15000.0);
    }

    #[test]
    fn test_unknown_power_rail_invalidates_bindings() {
        let sysfs = FakeSysfs::sample();
        let doc = SAMPLE_CONFIG.replace("\"BindedPowerRail\": \"VDD_CPU\"", "\"BindedPowerRail\": \"VDD_NOPE\"");
        let config = ThermalConfig::parse(&doc, ParseOptions::default()).unwrap();
        let helper = ThermalHelper::new(config, &sysfs.settings(), no_cb(), PowerHalClient::disconnected()).unwrap();

        let skin = helper.config().sensor_id("skin").unwrap();
        assert!(helper.config().sensor(skin).binded_cdevs.is_empty());
        assert!(!helper.sensor_status(skin).requests_cdevs());
        let cpu = helper.config().cdev_id("cpu").unwrap();
        assert!(!helper.cdev_statuses()[cpu.0].contains_key(&skin));
    }

    #[test]
    fn test_ceiling_clamped_to_max_state() {
        let sysfs = FakeSysfs::sample();
        let helper = sample_helper(&sysfs);
        let skin = helper.config().sensor(helper.config().sensor_id("skin").unwrap());
        assert!(skin.binded_cdevs[0].cdev_ceiling.iter().all(|&c| c <= 4));
    }

    #[test]
    fn test_disabled_control_parks_cdevs() {
        let sysfs = FakeSysfs::sample();
        fs::write(sysfs.cdev_dir("cpu").join(CUR_STATE), "3").unwrap();
        let mut settings = sysfs.settings();
        settings.disable_thermal_control = true;
        let config = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        let helper = ThermalHelper::new(config, &settings, no_cb(), PowerHalClient::disconnected()).unwrap();

        assert!(helper.is_throttling_disabled());
        assert!(helper.watched_sensors().is_empty());
        assert_eq!(fs::read_to_string(sysfs.cdev_dir("cpu").join(CUR_STATE)).unwrap(), "0");
    }

    #[test]
    #[serial]
    fn test_tick_throttles_and_notifies() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("skin", "45000");
        sysfs.set_temp("cpu0", "30000");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let config = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        let helper = ThermalHelper::new(
            config,
            &sysfs.settings(),
            Box::new(move |t| {
                assert_eq!(t.name, "skin");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            PowerHalClient::disconnected(),
        )
        .unwrap();

        let start = Instant::now();
        let sleep = helper.watcher_tick(&BTreeSet::new(), start);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(sleep >= MIN_POLL_INTERVAL);

        let skin = helper.config().sensor_id("skin").unwrap();
        assert_eq!(helper.sensor_status(skin).severity, Severity::Severe);
        // 45 degC sits on the SEVERE target: the budget is the sustainable
        // power, which maps to cpu state 2
        let cpu = helper.config().cdev_id("cpu").unwrap();
        assert_eq!(helper.cdev_statuses()[cpu.0][&skin], 2);
        assert_eq!(fs::read_to_string(sysfs.cdev_dir("cpu").join(CUR_STATE)).unwrap(), "2");

        // Nothing changed and nothing is due: no new notification
        helper.watcher_tick(&BTreeSet::new(), start + Duration::from_millis(10));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_uevent_forces_update() {
        let sysfs = FakeSysfs::sample();
        sysfs.set_temp("skin", "30000");
        let helper = sample_helper(&sysfs);
        let skin = helper.config().sensor_id("skin").unwrap();

        let start = Instant::now();
        helper.watcher_tick(&BTreeSet::new(), start);
        assert_eq!(helper.sensor_status(skin).severity, Severity::None);

        sysfs.set_temp("skin", "51000");
        let later = start + Duration::from_millis(100);
        helper.watcher_tick(&BTreeSet::new(), later);
        assert_eq!(helper.sensor_status(skin).severity, Severity::None);

        let events = BTreeSet::from(["skin".to_string()]);
        helper.watcher_tick(&events, later);
        assert_eq!(helper.sensor_status(skin).severity, Severity::Critical);
    }

    #[test]
    fn test_power_hint_transitions() {
        let sysfs = FakeSysfs::sample();
        let mut mock = MockPowerHintService::new();
        mock.expect_is_mode_supported()
            .returning(|hint| Ok(hint == "THERMAL_skin_MODERATE" || hint == "THERMAL_skin_CRITICAL"));
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        mock.expect_set_mode().returning(move |hint, enabled| {
            log.lock().push((hint.to_string(), enabled));
            Ok(())
        });

        let doc = SAMPLE_CONFIG.replace("\"Name\": \"skin\",", "\"Name\": \"skin\", \"SendPowerHint\": true,");
        let config = ThermalConfig::parse(&doc, ParseOptions::default()).unwrap();
        let helper =
            ThermalHelper::new(config, &sysfs.settings(), no_cb(), PowerHalClient::new(Some(Box::new(mock)))).unwrap();

        let skin = helper.config().sensor_id("skin").unwrap();
        let supported = helper.supported_power_hints(skin).unwrap();
        assert_eq!(supported[Severity::Severe.index()], Severity::Moderate);
        assert_eq!(supported[Severity::Shutdown.index()], Severity::Critical);

        let temp = |severity| Temperature {
            kind: TemperatureType::Skin,
            name: "skin".into(),
            value: 0.0,
            throttling_status: severity,
        };
        helper.send_power_ext_hint(&temp(Severity::Moderate));
        helper.send_power_ext_hint(&temp(Severity::Severe));
        helper.send_power_ext_hint(&temp(Severity::Critical));
        helper.send_power_ext_hint(&temp(Severity::None));

        assert_eq!(
            *sent.lock(),
            vec![
                ("THERMAL_skin_MODERATE".to_string(), true),
                ("THERMAL_skin_MODERATE".to_string(), false),
                ("THERMAL_skin_CRITICAL".to_string(), true),
                ("THERMAL_skin_CRITICAL".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_fill_listings() {
        let sysfs = FakeSysfs::sample();
        let helper = sample_helper(&sysfs);

        assert_eq!(helper.fill_temperatures().unwrap().len(), 4);
        let skins = helper.fill_current_temperatures(Some(TemperatureType::Skin)).unwrap();
        assert_eq!(skins.len(), 2);
        assert_eq!(helper.fill_temperature_thresholds(Some(TemperatureType::Cpu)).len(), 1);
        let gpus = helper.fill_current_cooling_devices(Some(CoolingType::Gpu)).unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].value, 0);

        fs::remove_file(sysfs.zone_dir("battery").join(TEMP_FILE)).unwrap();
        assert!(helper.fill_temperatures().is_err());
    }
}
