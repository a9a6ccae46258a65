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

//! Constants and default values for the thermal service
//!
//! Centralizes sysfs locations, file names and timing defaults.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Root holding `thermal_zone*` and `cooling_device*` directories
    pub const THERMAL_ROOT: &str = "/sys/devices/virtual/thermal";

    /// Root holding `iio:device*` energy meters
    pub const IIO_ROOT: &str = "/sys/bus/iio/devices";

    /// Kernel CPU statistics
    pub const PROC_STAT: &str = "/proc/stat";

    /// Per-CPU sysfs directories (`cpuN/online`)
    pub const CPU_ROOT: &str = "/sys/devices/system/cpu";

    /// Default thermal configuration document
    pub const CONFIG_FILE: &str = "/vendor/etc/thermal_info_config.json";

    /// Optional daemon settings file
    pub const SETTINGS_FILE: &str = "/vendor/etc/thermal_service.json";
}

/// File names inside a thermal zone or cooling device directory
pub mod sysfs {
    pub const SENSOR_PREFIX: &str = "thermal_zone";
    pub const COOLING_DEVICE_PREFIX: &str = "cooling_device";
    pub const TYPE_FILE: &str = "type";
    pub const POLICY_FILE: &str = "policy";
    pub const TEMP_FILE: &str = "temp";
    pub const TRIP_POINT_0_TEMP: &str = "trip_point_0_temp";
    pub const TRIP_POINT_0_HYST: &str = "trip_point_0_hyst";
    pub const USER_SPACE_POLICY: &str = "user_space";
    pub const CUR_STATE: &str = "cur_state";
    pub const MAX_STATE: &str = "max_state";
    pub const STATE2POWER_TABLE: &str = "state2power_table";

    /// Suffix appended to a cooling device name for its write path
    pub const WRITE_SUFFIX: &str = "_w";

    /// Substring identifying an energy meter directory
    pub const IIO_DEVICE_TYPE: &str = "iio:device";
    pub const ENERGY_VALUE: &str = "energy_value";
}

/// Scheduling defaults
pub mod timing {
    use super::Duration;

    /// Floor for every watcher sleep
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(2000);

    /// Polling delay used when a sensor does not set one
    pub const UEVENT_POLL_TIMEOUT: Duration = Duration::from_millis(300_000);

    /// Interval at which the daemon checks its shutdown flag
    pub const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
}

/// Uevent socket sizing
pub mod uevent {
    /// Receive buffer for one kernel uevent datagram
    pub const MSG_LEN: usize = 2048;

    /// All multicast groups
    pub const ALL_GROUPS: u32 = 0xffff_ffff;
}
