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

//! Daemon run loop: load the configuration, bring up the engine and keep the
//! watcher alive until shutdown is requested.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{ParseOptions, ThermalConfig};
use crate::constants::timing::SHUTDOWN_POLL;
use crate::facade::Thermal;
use crate::logger;
use crate::power_hint::PowerHalClient;
use crate::settings::Settings;
use crate::watcher::UeventSocket;

/// Parse the configuration named in `settings` and initialize the engine.
pub fn build(settings: &Settings) -> Result<Thermal> {
    let opts = ParseOptions { power_link_disabled: settings.disable_power_link };
    let config = ThermalConfig::load(&settings.config_path, opts)
        .with_context(|| format!("loading {}", settings.config_path.display()))?;
    if config.sensors.is_empty() {
        return Err(anyhow!("no sensors in {}", settings.config_path.display()));
    }
    info!(
        sensors = config.sensors.len(),
        cdevs = config.cdevs.len(),
        rails = config.power_rails.len(),
        "thermal configuration loaded"
    );

    Thermal::new(config, settings, PowerHalClient::disconnected()).context("initializing thermal engine")
}

/// Run until `shutdown` is set.
pub fn run(settings: &Settings, shutdown: &AtomicBool) -> Result<()> {
    if let Some(path) = &settings.journal_path {
        match logger::init_journal(path) {
            Ok(()) => logger::log_event("service_start", json!({ "config": settings.config_path })),
            Err(e) => warn!(path = %path.display(), error = %e, "event journal disabled"),
        }
    }

    let thermal = build(settings)?;
    if thermal.helper().is_throttling_disabled() {
        info!("thermal control disabled, cooling devices parked");
    } else {
        let source = UeventSocket::open().context("opening uevent socket")?;
        thermal.start(source).context("starting thermal watcher")?;
    }

    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(SHUTDOWN_POLL);
    }

    info!("shutting down thermal service");
    thermal.stop();
    logger::log_event("service_stop", json!({}));
    logger::close_journal();
    Ok(())
}
