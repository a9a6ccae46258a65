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

//! Query and notification surface of the thermal service.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thermal_error::{Result, ThermalError};
use tracing::{error, info, trace};

use crate::config::{CdevId, RailId, ThermalConfig};
use crate::engine::ThermalHelper;
use crate::power_hint::PowerHalClient;
use crate::settings::Settings;
use crate::types::{
    fmt_array, CoolingDevice, CoolingType, CpuUsage, Temperature, TemperatureThreshold,
    TemperatureType, TemperatureV1,
};
use crate::watcher::{EventSource, ThermalWatcher};

/// A listener for severity changes
#[cfg_attr(test, mockall::automock)]
pub trait ThermalChangedCallback: Send + Sync {
    /// An `Err` marks the listener dead; it is dropped from the registry.
    fn notify_throttling(&self, temp: &Temperature) -> Result<()>;
}

struct CallbackSetting {
    callback: Arc<dyn ThermalChangedCallback>,
    filter: Option<TemperatureType>,
}

fn same_callback(a: &Arc<dyn ThermalChangedCallback>, b: &Arc<dyn ThermalChangedCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Mutex<Vec<CallbackSetting>>,
}

impl CallbackRegistry {
    pub fn register(&self, callback: Arc<dyn ThermalChangedCallback>, filter: Option<TemperatureType>) -> Result<()> {
        let mut callbacks = self.callbacks.lock();
        if callbacks.iter().any(|c| same_callback(&c.callback, &callback)) {
            error!("Same callback registered already");
            return Err(ThermalError::CallbackAlreadyRegistered);
        }
        info!(filter = ?filter, "a callback has been registered");
        callbacks.push(CallbackSetting { callback, filter });
        Ok(())
    }

    pub fn unregister(&self, callback: &Arc<dyn ThermalChangedCallback>) -> Result<()> {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|c| {
            let found = same_callback(&c.callback, callback);
            if found {
                info!(filter = ?c.filter, "a callback has been unregistered");
            }
            !found
        });
        if callbacks.len() == before {
            error!("The callback was not registered before");
            return Err(ThermalError::CallbackNotRegistered);
        }
        Ok(())
    }

    /// Deliver `t` to every listener whose filter matches.
    pub fn send(&self, t: &Temperature) {
        trace!(
            kind = %t.kind,
            sensor = %t.name,
            value = t.value,
            status = %t.throttling_status,
            "Sending notification"
        );
        self.callbacks.lock().retain(|c| {
            if c.filter.is_some_and(|f| f != t.kind) {
                return true;
            }
            match c.callback.notify_throttling(t) {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "a Thermal callback is dead, removed from callback list");
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    fn filters(&self) -> Vec<Option<TemperatureType>> {
        self.callbacks.lock().iter().map(|c| c.filter).collect()
    }
}

/// The thermal service: engine, watcher and listeners
pub struct Thermal {
    helper: Arc<ThermalHelper>,
    callbacks: Arc<CallbackRegistry>,
    watcher: Mutex<ThermalWatcher>,
}

impl Thermal {
    pub fn new(config: ThermalConfig, settings: &Settings, power_hal: PowerHalClient) -> Result<Self> {
        let callbacks = Arc::new(CallbackRegistry::default());
        let registry = Arc::clone(&callbacks);
        let helper = ThermalHelper::new(config, settings, Box::new(move |t| registry.send(t)), power_hal)?;
        Ok(Self {
            helper: Arc::new(helper),
            callbacks,
            watcher: Mutex::new(ThermalWatcher::new()),
        })
    }

    pub fn helper(&self) -> &ThermalHelper {
        &self.helper
    }

    /// Start the watcher thread on `source`. Does nothing when thermal
    /// control is disabled.
    pub fn start<S: EventSource + 'static>(&self, source: S) -> Result<()> {
        if self.helper.is_throttling_disabled() {
            info!("thermal control disabled, watcher not started");
            return Ok(());
        }
        let mut watcher = self.watcher.lock();
        watcher.register_files_to_watch(self.helper.watched_sensors());
        let helper = Arc::clone(&self.helper);
        watcher.start(source, move |sensors: &BTreeSet<String>| helper.watcher_tick(sensors, Instant::now()))
    }

    pub fn wake(&self) {
        self.watcher.lock().wake();
    }

    pub fn stop(&self) {
        self.watcher.lock().stop();
    }

    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_running()
    }

    pub fn temperatures(&self) -> Result<Vec<TemperatureV1>> {
        self.helper.fill_temperatures()
    }

    pub fn current_temperatures(&self, filter: Option<TemperatureType>) -> Result<Vec<Temperature>> {
        self.helper.fill_current_temperatures(filter)
    }

    pub fn temperature_thresholds(&self, filter: Option<TemperatureType>) -> Vec<TemperatureThreshold> {
        self.helper.fill_temperature_thresholds(filter)
    }

    pub fn current_cooling_devices(&self, filter: Option<CoolingType>) -> Result<Vec<CoolingDevice>> {
        self.helper.fill_current_cooling_devices(filter)
    }

    pub fn cpu_usages(&self) -> Vec<CpuUsage> {
        self.helper.fill_cpu_usages()
    }

    pub fn register_callback(
        &self,
        callback: Arc<dyn ThermalChangedCallback>,
        filter: Option<TemperatureType>,
    ) -> Result<()> {
        self.callbacks.register(callback, filter)
    }

    pub fn unregister_callback(&self, callback: &Arc<dyn ThermalChangedCallback>) -> Result<()> {
        self.callbacks.unregister(callback)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn send_thermal_changed_callback(&self, t: &Temperature) {
        self.callbacks.send(t);
    }

    /// Human-readable dump of the whole service state
    pub fn debug_dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let config = self.helper.config();

        writeln!(out, "getTemperatures:")?;
        match self.temperatures() {
            Ok(temps) => {
                for t in temps {
                    writeln!(
                        out,
                        " Type: {} Name: {} CurrentValue: {} ThrottlingThreshold: {} ShutdownThreshold: {} VrThrottlingThreshold: {}",
                        t.kind, t.name, t.current_value, t.throttling_threshold, t.shutdown_threshold, t.vr_throttling_threshold
                    )?;
                }
            }
            Err(_) => writeln!(out, "Failed to read thermal sensors.")?,
        }

        writeln!(out, "getCpuUsages:")?;
        let usages = self.cpu_usages();
        if usages.is_empty() {
            writeln!(out, "Failed to get CPU usages.")?;
        }
        for u in usages {
            writeln!(out, " Name: {} Active: {} Total: {} IsOnline: {}", u.name, u.active, u.total, u.is_online)?;
        }

        writeln!(out, "getCurrentTemperatures:")?;
        match self.current_temperatures(None) {
            Ok(temps) => {
                for t in temps {
                    writeln!(
                        out,
                        " Type: {} Name: {} CurrentValue: {} ThrottlingStatus: {}",
                        t.kind, t.name, t.value, t.throttling_status
                    )?;
                }
            }
            Err(_) => writeln!(out, "Failed to getCurrentTemperatures.")?,
        }

        writeln!(out, "getTemperatureThresholds:")?;
        for t in self.temperature_thresholds(None) {
            writeln!(
                out,
                " Type: {} Name: {} hotThrottlingThreshold: {} coldThrottlingThreshold: {} vrThrottlingThreshold: {}",
                t.kind,
                t.name,
                fmt_array(&t.hot_thresholds),
                fmt_array(&t.cold_thresholds),
                t.vr_threshold
            )?;
        }

        writeln!(out, "getCurrentCoolingDevices:")?;
        match self.current_cooling_devices(None) {
            Ok(cdevs) => {
                for c in cdevs {
                    writeln!(out, " Type: {} Name: {} CurrentValue: {}", c.kind, c.name, c.value)?;
                }
            }
            Err(_) => writeln!(out, "Failed to getCurrentCoolingDevices.")?,
        }

        let filters = self.callbacks.filters();
        writeln!(out, "Callbacks: Total {}", filters.len())?;
        for f in filters {
            match f {
                Some(kind) => writeln!(out, " IsFilter: true Type: {kind}")?,
                None => writeln!(out, " IsFilter: false Type: N/A")?,
            }
        }

        writeln!(out, "getHysteresis:")?;
        for s in &config.sensors {
            writeln!(
                out,
                " Name: {} hotHysteresis: {} coldHysteresis: {}",
                s.name,
                fmt_array(&s.hot_hysteresis),
                fmt_array(&s.cold_hysteresis)
            )?;
        }

        writeln!(out, "SendCallback")?;
        write!(out, "  Enabled List: ")?;
        for s in config.sensors.iter().filter(|s| s.send_cb) {
            write!(out, "{} ", s.name)?;
        }
        writeln!(out)?;

        writeln!(out, "SendPowerHint")?;
        write!(out, "  Enabled List: ")?;
        for s in config.sensors.iter().filter(|s| s.send_powerhint) {
            write!(out, "{} ", s.name)?;
        }
        writeln!(out)?;

        self.dump_virtual_sensor_info(out)?;
        self.dump_throttling_info(out)?;
        self.dump_throttling_request_status(out)?;
        self.dump_power_rail_info(out)?;

        let hal = self.helper.power_hal();
        writeln!(out, "Power Hal exist: {}", hal.exists())?;
        writeln!(out, "Power Hal connected: {}", hal.is_connected())?;
        Ok(())
    }

    fn dump_virtual_sensor_info<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "VirtualSensorInfo:")?;
        for s in &self.helper.config().sensors {
            let Some(vs) = &s.virtual_sensor else { continue };
            writeln!(out, " Name: {}", s.name)?;
            writeln!(out, "  LinkedSensorName: {}", fmt_array(&vs.linked_sensors))?;
            writeln!(out, "  LinkedSensorCoefficient: {}", fmt_array(&vs.coefficients))?;
            writeln!(out, "  Offset: {}", vs.offset)?;
            let trigger = if vs.trigger_sensor.is_empty() { "N/A" } else { vs.trigger_sensor.as_str() };
            writeln!(out, "  Trigger Sensor: {trigger}")?;
            writeln!(out, "  Formula: {}", vs.formula)?;
        }
        Ok(())
    }

    fn dump_throttling_info<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Throttling Info:")?;
        for s in &self.helper.config().sensors {
            if s.pid.is_none() && s.binded_cdevs.is_empty() {
                continue;
            }
            writeln!(out, " Name: {}", s.name)?;
            if let Some(pid) = &s.pid {
                writeln!(out, "  PID Info:")?;
                writeln!(out, "   K_po: {}", fmt_array(&pid.k_po))?;
                writeln!(out, "   K_pu: {}", fmt_array(&pid.k_pu))?;
                writeln!(out, "   K_i: {}", fmt_array(&pid.k_i))?;
                writeln!(out, "   K_d: {}", fmt_array(&pid.k_d))?;
                writeln!(out, "   i_max: {}", fmt_array(&pid.i_max))?;
                writeln!(out, "   max_alloc_power: {}", fmt_array(&pid.max_alloc_power))?;
                writeln!(out, "   min_alloc_power: {}", fmt_array(&pid.min_alloc_power))?;
                writeln!(out, "   s_power: {}", fmt_array(&pid.s_power))?;
                writeln!(out, "   i_cutoff: {}", fmt_array(&pid.i_cutoff))?;
            }
            writeln!(out, "  Binded CDEV Info:")?;
            for b in &s.binded_cdevs {
                writeln!(out, "   Cooling device name: {}", b.cdev_name)?;
                writeln!(out, "    WeightForPID: {}", fmt_array(&b.cdev_weight_for_pid))?;
                writeln!(out, "    Ceiling: {}", fmt_array(&b.cdev_ceiling))?;
                writeln!(out, "    Floor with PowerLink: {}", fmt_array(&b.cdev_floor_with_power_link))?;
                writeln!(out, "    Hard limit: {}", fmt_array(&b.limit_info))?;
                if !b.power_rail_name.is_empty() {
                    writeln!(out, "    Binded power rail: {}", b.power_rail_name)?;
                    writeln!(out, "    Power threshold: {}", fmt_array(&b.power_thresholds))?;
                    writeln!(out, "    Release logic: {}", b.release_logic.as_str())?;
                    writeln!(out, "    high_power_check: {}", b.high_power_check)?;
                    writeln!(out, "    throttling_with_power_link: {}", b.throttling_with_power_link)?;
                }
            }
        }
        Ok(())
    }

    fn dump_throttling_request_status<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let config = self.helper.config();
        let cdev_status = self.helper.cdev_statuses();
        let sensor_status = self.helper.sensor_statuses();
        let power_files = self.helper.power_files();

        writeln!(out, "Throttling Request Status ")?;
        for (idx, requests) in cdev_status.iter().enumerate() {
            let cdev = CdevId(idx);
            writeln!(out, " Name: {}", config.cdev(cdev).name)?;
            for (&sensor, &state) in requests {
                let status = &sensor_status[sensor.0];
                writeln!(out, "  Request Sensor: {}", config.sensor(sensor).name)?;
                writeln!(out, "   Request Throttling State: {state}")?;
                if let Some(pid) = status.pid_request_map.get(&cdev) {
                    writeln!(out, "   PID Request State: {pid}")?;
                }
                if let Some(limit) = status.hard_limit_request_map.get(&cdev) {
                    writeln!(out, "   Hard Limit Request State: {limit}")?;
                }
                if let Some(release) = power_files.release_status(sensor, cdev) {
                    writeln!(out, "   Release Step: {}", release.release_step)?;
                }
            }
        }
        Ok(())
    }

    fn dump_power_rail_info<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let config = self.helper.config();
        let power_files = self.helper.power_files();

        writeln!(out, "Power Rail Info ")?;
        for (idx, rail) in config.power_rails.iter().enumerate() {
            writeln!(out, " Power Rail: {}", rail.name)?;
            writeln!(out, "  Power Sample Count: {}", rail.power_sample_count)?;
            writeln!(out, "  Power Sample Delay: {}", rail.power_sample_delay.as_millis())?;
            for (sensor, status) in power_files.power_status_for_rail(RailId(idx)) {
                writeln!(out, "  Request Sensor: {}", config.sensor(sensor).name)?;
                writeln!(out, "   Last Updated AVG Power: {} mW", status.last_updated_avg_power)?;
                if let Some(vr) = &rail.virtual_power_rail {
                    writeln!(out, "   Formula={}", vr.formula)?;
                }
                for history in &status.power_history {
                    match &rail.virtual_power_rail {
                        Some(vr) => {
                            writeln!(out, "   Linked power rail {}", history.rail)?;
                            match vr.linked_power_rails.iter().position(|r| *r == history.rail) {
                                Some(i) => writeln!(out, "    Coefficient={}", vr.coefficients[i])?,
                                None => writeln!(out, "    Coefficient=N/A")?,
                            }
                            write!(out, "    Power Samples: ")?;
                        }
                        None => write!(out, "   Power Samples: ")?,
                    }
                    for sample in &history.samples {
                        write!(out, "(T={}, uWs={}) ", sample.duration, sample.energy_counter)?;
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParseOptions;
    use crate::test_utils::test_utils::{create_iio_tree, FakeSysfs, SAMPLE_CONFIG};
    use crate::types::Severity;

    fn temp(kind: TemperatureType) -> Temperature {
        Temperature { kind, name: "skin".into(), value: 45.0, throttling_status: Severity::Severe }
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = CallbackRegistry::default();
        let cb: Arc<dyn ThermalChangedCallback> = Arc::new(MockThermalChangedCallback::new());

        registry.register(Arc::clone(&cb), None).unwrap();
        assert!(matches!(
            registry.register(Arc::clone(&cb), Some(TemperatureType::Skin)),
            Err(ThermalError::CallbackAlreadyRegistered)
        ));
        assert_eq!(registry.len(), 1);

        registry.unregister(&cb).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.unregister(&cb), Err(ThermalError::CallbackNotRegistered)));
    }

    #[test]
    fn test_send_respects_filter() {
        let registry = CallbackRegistry::default();
        let mut skin = MockThermalChangedCallback::new();
        skin.expect_notify_throttling().times(1).returning(|_| Ok(()));
        let mut cpu = MockThermalChangedCallback::new();
        cpu.expect_notify_throttling().times(0);

        registry.register(Arc::new(skin), Some(TemperatureType::Skin)).unwrap();
        registry.register(Arc::new(cpu), Some(TemperatureType::Cpu)).unwrap();
        registry.send(&temp(TemperatureType::Skin));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dead_callback_pruned() {
        let registry = CallbackRegistry::default();
        let mut dead = MockThermalChangedCallback::new();
        dead.expect_notify_throttling()
            .times(1)
            .returning(|_| Err(ThermalError::generic("binder died")));
        let mut alive = MockThermalChangedCallback::new();
        alive.expect_notify_throttling().times(2).returning(|_| Ok(()));

        registry.register(Arc::new(dead), None).unwrap();
        registry.register(Arc::new(alive), None).unwrap();
        registry.send(&temp(TemperatureType::Skin));
        assert_eq!(registry.len(), 1);
        registry.send(&temp(TemperatureType::Skin));
    }

    #[test]
    fn test_debug_dump_sections() {
        let sysfs = FakeSysfs::sample();
        let config = ThermalConfig::parse(SAMPLE_CONFIG, ParseOptions::default()).unwrap();
        let thermal = Thermal::new(config, &sysfs.settings(), PowerHalClient::disconnected()).unwrap();
        let cb: Arc<dyn ThermalChangedCallback> = Arc::new(MockThermalChangedCallback::new());
        thermal.register_callback(cb, Some(TemperatureType::Skin)).unwrap();

        let mut buf = Vec::new();
        thermal.debug_dump(&mut buf).unwrap();
        let dump = String::from_utf8(buf).unwrap();

        let sections = [
            "getTemperatures:",
            "getCpuUsages:",
            "getCurrentTemperatures:",
            "getTemperatureThresholds:",
            "getCurrentCoolingDevices:",
            "Callbacks: Total 1",
            "getHysteresis:",
            "SendCallback",
            "VirtualSensorInfo:",
            "Throttling Info:",
            "Throttling Request Status ",
            "Power Rail Info ",
            "Power Hal exist: false",
        ];
        let mut last = 0;
        for s in sections {
            let pos = dump[last..].find(s).unwrap_or_else(|| panic!("missing {s:?}")) + last;
            last = pos;
        }

        assert!(dump.contains(" IsFilter: true Type: SKIN"));
        assert!(dump.contains("  Enabled List: skin \n"));
        assert!(dump.contains("  LinkedSensorName: [cpu0 skin ]"));
        assert!(dump.contains("  Formula: WEIGHTED_AVG"));
        assert!(dump.contains("    Release logic: STEPWISE"));
        assert!(dump.contains(" Type: GPU Name: gpu CurrentValue: 0"));
    }

    #[test]
    fn test_debug_dump_labels_virtual_rail_histories_by_name() {
        let sysfs = FakeSysfs::new();
        sysfs.add_zone(0, "skin", "30", Some("user_space"));
        sysfs.add_cdev(0, "cpu", 4);
        create_iio_tree(&sysfs.iio_root(), "CH0(T=1000)[VDD_B], 500\n");
        let doc = r#"{
            "Sensors": [{
                "Name": "skin", "Type": "SKIN",
                "HotThreshold": ["NAN", "NAN", 40, 45, 50, 55, 60],
                "BindedCdevInfo": [{
                    "CdevRequest": "cpu",
                    "LimitInfo": [0, 0, 1, 2, 3, 4, 4],
                    "BindedPowerRail": "VIRT"
                }]
            }],
            "CoolingDevices": [{ "Name": "cpu", "Type": "CPU" }],
            "PowerRails": [{
                "Name": "VIRT",
                "VirtualRails": true,
                "Combination": ["VDD_A", "VDD_B"],
                "Coefficient": [1.5, 7.0],
                "Formula": "WEIGHTED_AVG",
                "PowerSampleCount": 1,
                "PowerSampleDelay": 1000
            }]
        }"#;
        let config = ThermalConfig::parse(doc, ParseOptions::default()).unwrap();
        let thermal = Thermal::new(config, &sysfs.settings(), PowerHalClient::disconnected()).unwrap();

        let mut buf = Vec::new();
        thermal.debug_dump(&mut buf).unwrap();
        let dump = String::from_utf8(buf).unwrap();

        assert!(dump.contains("  Request Sensor: skin"));
        assert!(dump.contains("   Linked power rail VDD_B\n    Coefficient=7\n"));
        assert!(!dump.contains("Linked power rail VDD_A"));
    }
}
