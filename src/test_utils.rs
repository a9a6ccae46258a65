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

//! Shared fixtures for unit tests: a sample configuration, binding and PID
//! builders, and a fake sysfs tree.

#[cfg(test)]
pub mod test_utils {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use crate::config::{BindedCdevInfo, CdevId, CdevInfo, PidInfo, RailId, ReleaseLogic};
    use crate::constants::sysfs::{
        COOLING_DEVICE_PREFIX, CUR_STATE, ENERGY_VALUE, IIO_DEVICE_TYPE, MAX_STATE, POLICY_FILE,
        SENSOR_PREFIX, TEMP_FILE, TYPE_FILE, USER_SPACE_POLICY,
    };
    use crate::settings::Settings;
    use crate::types::{CoolingType, ThrottlingArray, SEVERITY_COUNT};

    /// Four sensors, two cooling devices and two power rails.
    ///
    /// `skin` is the PID-controlled sensor driving `cpu`; `cpu0` hard-limits
    /// `gpu`; `battery` is read-only; `virt_skin` averages `cpu0` and `skin`.
    pub const SAMPLE_CONFIG: &str = r#"{
    "Sensors": [
        {
            "Name": "cpu0",
            "Type": "CPU",
            "HotThreshold": ["NAN", 60, 70, 80, 90, 100, 110],
            "HotHysteresis": [0, 2, 2, 2, 2, 2, 2],
            "Multiplier": 0.001,
            "BindedCdevInfo": [
                { "CdevRequest": "gpu", "LimitInfo": [0, 1, 1, 2, 2, 2, 2] }
            ]
        },
        {
            "Name": "battery",
            "Type": "BATTERY",
            "HotThreshold": ["NAN", "NAN", "NAN", "NAN", "NAN", "NAN", 60],
            "Multiplier": 0.001
        },
        {
            "Name": "skin",
            "Type": "SKIN",
            "HotThreshold": ["NAN", "NAN", 40, 45, 50, 55, 60],
            "HotHysteresis": [0, 0, 2, 2, 2, 2, 2],
            "VrThreshold": 48,
            "Multiplier": 0.001,
            "Monitor": true,
            "PIDInfo": {
                "K_Po": ["NAN", "NAN", 1000, 1000, "NAN", "NAN", "NAN"],
                "K_Pu": ["NAN", "NAN", 1, 1, "NAN", "NAN", "NAN"],
                "K_I": ["NAN", "NAN", 0, 0, "NAN", "NAN", "NAN"],
                "K_D": ["NAN", "NAN", 0, 0, "NAN", "NAN", "NAN"],
                "I_Max": ["NAN", "NAN", 1, 1, "NAN", "NAN", "NAN"],
                "MaxAllocPower": ["NAN", "NAN", 10000, 10000, "NAN", "NAN", "NAN"],
                "MinAllocPower": ["NAN", "NAN", 100, 100, "NAN", "NAN", "NAN"],
                "S_Power": ["NAN", "NAN", 3000, 2000, "NAN", "NAN", "NAN"],
                "I_Cutoff": ["NAN", "NAN", 0, 0, "NAN", "NAN", "NAN"]
            },
            "BindedCdevInfo": [
                {
                    "CdevRequest": "cpu",
                    "CdevWeightForPID": ["NAN", "NAN", 1, 1, 1, 1, 1],
                    "BindedPowerRail": "VDD_CPU",
                    "PowerThreshold": [5000, 5000, 4000, 3000, 2000, 1000, 500],
                    "ReleaseLogic": "STEPWISE"
                }
            ]
        },
        {
            "Name": "virt_skin",
            "Type": "SKIN",
            "VirtualSensor": true,
            "Combination": ["cpu0", "skin"],
            "Coefficient": [0.5, 0.5],
            "Formula": "WEIGHTED_AVG",
            "TriggerSensor": "skin",
            "HotThreshold": ["NAN", "NAN", 45, 50, 55, 60, 65],
            "Multiplier": 0.001
        }
    ],
    "CoolingDevices": [
        { "Name": "cpu", "Type": "CPU", "State2Power": [3000, 2000, 1000, 500, 0] },
        { "Name": "gpu", "Type": "GPU", "State2Power": [2000, 1000, 0] }
    ],
    "PowerRails": [
        { "Name": "VDD_CPU", "PowerSampleCount": 2, "PowerSampleDelay": 1000 },
        {
            "Name": "VIRT_SOC",
            "VirtualRails": true,
            "Combination": ["VDD_CPU", "VDD_GPU"],
            "Coefficient": [1, 1],
            "Formula": "WEIGHTED_AVG",
            "PowerSampleCount": 1,
            "PowerSampleDelay": 2000
        }
    ]
}"#;

    /// Binding with no PID weight, no hard limit and no power link
    pub fn binding_for(cdev_name: &str, cdev: CdevId) -> BindedCdevInfo {
        BindedCdevInfo {
            cdev_name: cdev_name.to_string(),
            cdev: Some(cdev),
            limit_info: [0; SEVERITY_COUNT],
            power_thresholds: [f32::NAN; SEVERITY_COUNT],
            release_logic: ReleaseLogic::None,
            high_power_check: false,
            throttling_with_power_link: false,
            cdev_weight_for_pid: [f32::NAN; SEVERITY_COUNT],
            cdev_ceiling: [i32::MAX; SEVERITY_COUNT],
            cdev_floor_with_power_link: [0; SEVERITY_COUNT],
            power_rail_name: String::new(),
            power_rail: None,
        }
    }

    /// Binding to cooling device 0 linked to `rail`
    pub fn binding_with_rail(cdev_name: &str, rail: RailId, logic: ReleaseLogic) -> BindedCdevInfo {
        BindedCdevInfo {
            release_logic: logic,
            power_rail_name: format!("rail{}", rail.0),
            power_rail: Some(rail),
            ..binding_for(cdev_name, CdevId(0))
        }
    }

    pub fn cdev_info(name: &str, state2power: Vec<f32>) -> CdevInfo {
        CdevInfo {
            name: name.to_string(),
            kind: CoolingType::Component,
            read_path: None,
            write_path: None,
            max_state: state2power.len().saturating_sub(1) as i32,
            state2power,
            power_rail: String::new(),
        }
    }

    /// PID terms defined wherever `s_power` is. The integral and derivative
    /// terms are inert, so the budget is `s_power + 1000 * err` when over
    /// target, clamped to [100, 10000].
    pub fn pid_info(s_power: ThrottlingArray) -> PidInfo {
        let at = |v: f32| -> ThrottlingArray {
            let mut out = [f32::NAN; SEVERITY_COUNT];
            for (i, p) in s_power.iter().enumerate() {
                if !p.is_nan() {
                    out[i] = v;
                }
            }
            out
        };
        PidInfo {
            k_po: at(1000.0),
            k_pu: at(1.0),
            k_i: at(0.0),
            k_d: at(0.0),
            i_max: at(1.0),
            max_alloc_power: at(10000.0),
            min_alloc_power: at(100.0),
            s_power,
            i_cutoff: at(0.0),
        }
    }

    /// One `iio:device0` meter holding `content`; returns its energy file
    pub fn create_iio_tree(root: &Path, content: &str) -> PathBuf {
        let dev = root.join(format!("{IIO_DEVICE_TYPE}0"));
        fs::create_dir_all(&dev).unwrap();
        let energy = dev.join(ENERGY_VALUE);
        fs::write(&energy, content).unwrap();
        energy
    }

    /// Throwaway `thermal_zone*` / `cooling_device*` tree
    pub struct FakeSysfs {
        dir: TempDir,
    }

    impl FakeSysfs {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("thermal")).unwrap();
            fs::create_dir_all(dir.path().join("iio")).unwrap();
            fs::create_dir_all(dir.path().join("cpu")).unwrap();
            Self { dir }
        }

        /// Tree matching [`SAMPLE_CONFIG`]. Only `skin` accepts user-space policy.
        pub fn sample() -> Self {
            let sysfs = Self::new();
            sysfs.add_zone(0, "cpu0", "30000", Some("step_wise"));
            sysfs.add_zone(1, "battery", "25000", Some("step_wise"));
            sysfs.add_zone(2, "skin", "30000", Some(USER_SPACE_POLICY));
            sysfs.add_cdev(0, "cpu", 4);
            sysfs.add_cdev(1, "gpu", 2);
            sysfs
        }

        pub fn thermal_root(&self) -> PathBuf {
            self.dir.path().join("thermal")
        }

        pub fn iio_root(&self) -> PathBuf {
            self.dir.path().join("iio")
        }

        pub fn add_zone(&self, idx: usize, name: &str, temp: &str, policy: Option<&str>) -> PathBuf {
            let zone = self.thermal_root().join(format!("{SENSOR_PREFIX}{idx}"));
            fs::create_dir_all(&zone).unwrap();
            fs::write(zone.join(TYPE_FILE), format!("{name}\n")).unwrap();
            fs::write(zone.join(TEMP_FILE), format!("{temp}\n")).unwrap();
            if let Some(policy) = policy {
                fs::write(zone.join(POLICY_FILE), format!("{policy}\n")).unwrap();
            }
            zone
        }

        pub fn add_cdev(&self, idx: usize, name: &str, max_state: i32) -> PathBuf {
            let cdev = self.thermal_root().join(format!("{COOLING_DEVICE_PREFIX}{idx}"));
            fs::create_dir_all(&cdev).unwrap();
            fs::write(cdev.join(TYPE_FILE), format!("{name}\n")).unwrap();
            fs::write(cdev.join(CUR_STATE), "0\n").unwrap();
            fs::write(cdev.join(MAX_STATE), format!("{max_state}\n")).unwrap();
            cdev
        }

        fn find(&self, prefix: &str, name: &str) -> PathBuf {
            fs::read_dir(self.thermal_root())
                .unwrap()
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
                .find(|p| fs::read_to_string(p.join(TYPE_FILE)).unwrap().trim() == name)
                .unwrap_or_else(|| panic!("no {prefix} named {name}"))
        }

        pub fn zone_dir(&self, name: &str) -> PathBuf {
            self.find(SENSOR_PREFIX, name)
        }

        pub fn cdev_dir(&self, name: &str) -> PathBuf {
            self.find(COOLING_DEVICE_PREFIX, name)
        }

        pub fn set_temp(&self, name: &str, temp: &str) {
            fs::write(self.zone_dir(name).join(TEMP_FILE), format!("{temp}\n")).unwrap();
        }

        pub fn settings(&self) -> Settings {
            Settings {
                config_path: self.dir.path().join("thermal_info_config.json"),
                thermal_root: self.thermal_root(),
                iio_root: self.iio_root(),
                proc_stat: self.dir.path().join("stat"),
                cpu_root: self.dir.path().join("cpu"),
                ..Settings::default()
            }
        }
    }
}
