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

//! Per-CPU usage from `/proc/stat`

use std::path::Path;

use tracing::{debug, error};

use crate::files::read_trimmed;
use crate::types::CpuUsage;

/// Parse the `cpuN` lines of `proc_stat` content. Online state comes from
/// `<cpu_root>/cpuN/online`; cpu0 is taken as online when that file is
/// missing, any other CPU as offline.
pub fn parse_cpu_usages(content: &str, cpu_root: &Path) -> Vec<CpuUsage> {
    let mut usages = Vec::new();
    for line in content.lines() {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else { continue };
        let Some(num) = name.strip_prefix("cpu") else { continue };
        let Ok(cpu_num) = num.parse::<u32>() else { continue };

        let fields: Vec<u64> = words.take(4).filter_map(|w| w.parse().ok()).collect();
        let [user, nice, system, idle] = fields[..] else {
            error!(line, "Unexpected cpu stat line");
            continue;
        };

        let online_path = cpu_root.join(name).join("online");
        let is_online = match read_trimmed(&online_path) {
            Ok(v) => v == "1",
            Err(e) => {
                debug!(error = %e, "Could not read cpu online file");
                cpu_num == 0
            }
        };

        let active = user + nice + system;
        usages.push(CpuUsage {
            name: name.to_string(),
            active,
            total: active + idle,
            is_online,
        });
    }
    usages
}

/// Read `proc_stat` and return one entry per CPU it lists.
pub fn cpu_usages(proc_stat: &Path, cpu_root: &Path) -> Vec<CpuUsage> {
    match read_trimmed(proc_stat) {
        Ok(content) => parse_cpu_usages(&content, cpu_root),
        Err(e) => {
            error!(error = %e, "Error reading cpu usage file");
            Vec::new()
        }
    }
}
