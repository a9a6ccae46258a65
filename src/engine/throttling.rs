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

//! Severity classification, PID power budget and cooling-device request
//! mapping. Nothing here touches sysfs or locks.

use std::collections::BTreeMap;
use std::time::Duration;

use thermal_error::{Result, ThermalError};
use tracing::trace;

use crate::config::{BindedCdevInfo, CdevId, CdevInfo, PidInfo};
use crate::types::{Severity, ThrottlingArray, SEVERITY_COUNT};

/// Classify `value` against hot and cold thresholds.
///
/// Returns `(hot, cold)`. A level rises as soon as its threshold is met but
/// only falls once the value clears the threshold minus hysteresis (plus, for
/// cold), relative to the previously reported level.
pub fn severity_from_thresholds(
    hot_thresholds: &ThrottlingArray,
    cold_thresholds: &ThrottlingArray,
    hot_hysteresis: &ThrottlingArray,
    cold_hysteresis: &ThrottlingArray,
    prev_hot_severity: Severity,
    prev_cold_severity: Severity,
    value: f32,
) -> (Severity, Severity) {
    let mut ret_hot = Severity::None;
    let mut ret_hot_hysteresis = Severity::None;
    let mut ret_cold = Severity::None;
    let mut ret_cold_hysteresis = Severity::None;

    for i in (1..SEVERITY_COUNT).rev() {
        let level = Severity::ALL[i];
        let hot = hot_thresholds[i];
        let cold = cold_thresholds[i];

        if !hot.is_nan() {
            if ret_hot == Severity::None && hot <= value {
                ret_hot = level;
            }
            if ret_hot_hysteresis == Severity::None && hot - hot_hysteresis[i] < value {
                ret_hot_hysteresis = level;
            }
        }
        if !cold.is_nan() {
            if ret_cold == Severity::None && cold >= value {
                ret_cold = level;
            }
            if ret_cold_hysteresis == Severity::None && cold + cold_hysteresis[i] > value {
                ret_cold_hysteresis = level;
            }
        }
    }

    if ret_hot < prev_hot_severity {
        ret_hot = ret_hot_hysteresis;
    }
    if ret_cold < prev_cold_severity {
        ret_cold = ret_cold_hysteresis;
    }
    (ret_hot, ret_cold)
}

/// Highest level with a defined `s_power` that is not above `severity`, or
/// the first defined level above it. 0 when none is defined.
pub fn pid_target_state(pid: &PidInfo, severity: Severity) -> usize {
    let mut target_state = 0;
    for level in Severity::ALL {
        let state = level.index();
        if pid.s_power[state].is_nan() {
            continue;
        }
        target_state = state;
        if level > severity {
            break;
        }
    }
    target_state
}

/// Compute the power budget for `target_state`.
///
/// `err_integral` and `prev_err` are updated in place. Returns `f32::MAX`
/// (no constraint) and resets both when there is no target or the sensor is
/// not throttling.
#[allow(clippy::too_many_arguments)]
pub fn pid_power_budget(
    pid: &PidInfo,
    hot_thresholds: &ThrottlingArray,
    value: f32,
    severity: Severity,
    target_state: usize,
    time_elapsed: Duration,
    err_integral: &mut f32,
    prev_err: &mut f32,
) -> f32 {
    if target_state == 0 || severity == Severity::None {
        *err_integral = 0.0;
        *prev_err = f32::NAN;
        return f32::MAX;
    }

    let t = target_state;
    let err = hot_thresholds[t] - value;
    let p = err * if err < 0.0 { pid.k_po[t] } else { pid.k_pu[t] };

    let mut i = *err_integral * pid.k_i[t];
    if err < pid.i_cutoff[t] {
        let i_next = i + err * pid.k_i[t];
        if i_next.abs() < pid.i_max[t] {
            i = i_next;
            *err_integral += err;
        }
    }

    let elapsed_ms = time_elapsed.as_millis();
    let d = if !prev_err.is_nan() && elapsed_ms != 0 {
        pid.k_d[t] * (err - *prev_err) / elapsed_ms as f32
    } else {
        0.0
    };
    *prev_err = err;

    let budget = (pid.s_power[t] + p + i + d)
        .max(pid.min_alloc_power[t])
        .min(pid.max_alloc_power[t]);

    trace!(
        target_state = t,
        budget,
        err,
        err_integral = *err_integral,
        p,
        i,
        d,
        elapsed_ms = elapsed_ms as u64,
        "pid power budget"
    );
    budget
}

/// Split `total_power_budget` over the bindings by their PID weight at
/// `target_state` and map each share onto a cooling state.
///
/// Only devices already present in `requests` are updated. Fails when the
/// weights at `target_state` sum to zero.
pub fn request_cdev_by_power(
    bindings: &[BindedCdevInfo],
    cdevs: &[CdevInfo],
    total_power_budget: f32,
    target_state: usize,
    requests: &mut BTreeMap<CdevId, i32>,
) -> Result<()> {
    let total_weight: f32 = bindings
        .iter()
        .map(|b| b.cdev_weight_for_pid[target_state])
        .filter(|w| !w.is_nan())
        .sum();

    if total_weight == 0.0 {
        return Err(ThermalError::generic("total weight value is zero"));
    }

    for b in bindings {
        let weight = b.cdev_weight_for_pid[target_state];
        if weight.is_nan() {
            continue;
        }
        let Some(cdev) = b.cdev else { continue };
        let share = total_power_budget * (weight / total_weight);
        let state = state_for_power(&cdevs[cdev.0].state2power, share);
        if let Some(slot) = requests.get_mut(&cdev) {
            *slot = state as i32;
        }
        trace!(cdev = %b.cdev_name, share, weight, state, "power allocator");
    }
    Ok(())
}

/// First state whose power draw the share exceeds, capped at the last state.
fn state_for_power(state2power: &[f32], share: f32) -> usize {
    let last = state2power.len().saturating_sub(1);
    state2power[..last]
        .iter()
        .position(|&p| share > p)
        .unwrap_or(last)
}

/// Hard-limit request: the binding's limit for the current severity.
pub fn request_cdev_by_severity(
    bindings: &[BindedCdevInfo],
    severity: Severity,
    requests: &mut BTreeMap<CdevId, i32>,
) {
    for b in bindings {
        let Some(cdev) = b.cdev else { continue };
        if let Some(slot) = requests.get_mut(&cdev) {
            *slot = b.limit_info[severity.index()];
            trace!(cdev = %b.cdev_name, state = *slot, "hard limit");
        }
    }
}

/// Combine PID and hard-limit requests, apply the release step and clamp.
///
/// The floor only applies while a release step is active.
pub fn merge_cdev_request(
    pid_request: i32,
    hard_limit_request: i32,
    release_step: i32,
    floor: i32,
    ceiling: i32,
) -> i32 {
    let mut state = pid_request.max(hard_limit_request);
    if release_step != 0 {
        state = if release_step >= state { 0 } else { state - release_step };
        state = state.max(floor);
    }
    state.min(ceiling)
}
