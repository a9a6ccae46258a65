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

//! Power-management hint forwarding.
//!
//! Severity transitions of sensors flagged `SendPowerHint` are forwarded as
//! `THERMAL_<sensor>_<SEVERITY>` modes to an external power service. The
//! transport is behind [`PowerHintService`]; the daemon runs without one
//! unless a backend is plugged in.

use parking_lot::Mutex;
use thermal_error::Result;
use tracing::{error, info};

use crate::types::Severity;

/// Remote power-management endpoint
#[cfg_attr(test, mockall::automock)]
pub trait PowerHintService: Send + Sync {
    fn is_mode_supported(&self, hint: &str) -> Result<bool>;
    fn set_mode(&self, hint: &str, enabled: bool) -> Result<()>;
}

/// Mode name for `sensor` at `severity`
pub fn hint_name(sensor: &str, severity: Severity) -> String {
    format!("THERMAL_{sensor}_{severity}")
}

struct ClientState {
    service: Option<Box<dyn PowerHintService>>,
    /// Cleared for good once the service fails
    exist: bool,
    connected: bool,
}

/// Connection wrapper around an optional [`PowerHintService`].
///
/// Any failed call drops the service and marks the client disconnected, so
/// later hints become no-ops.
pub struct PowerHalClient {
    state: Mutex<ClientState>,
}

impl PowerHalClient {
    pub fn new(service: Option<Box<dyn PowerHintService>>) -> Self {
        let exist = service.is_some();
        Self {
            state: Mutex::new(ClientState { service, exist, connected: false }),
        }
    }

    /// Client with no backend. Every query reports unsupported.
    pub fn disconnected() -> Self {
        Self::new(None)
    }

    pub fn connect(&self) -> bool {
        let mut state = self.state.lock();
        if !state.exist {
            return false;
        }
        if state.service.is_none() {
            error!("Cannot get power hint service");
            state.exist = false;
            return false;
        }
        state.connected = true;
        true
    }

    pub fn exists(&self) -> bool {
        self.state.lock().exist
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.connected && state.service.is_some()
    }

    pub fn is_mode_supported(&self, sensor: &str, severity: Severity) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        let Some(service) = state.service.as_ref() else {
            return false;
        };
        let hint = hint_name(sensor, severity);
        match service.is_mode_supported(&hint) {
            Ok(supported) => supported,
            Err(e) => {
                error!(hint = %hint, error = %e, "Fail to check supported mode");
                Self::drop_service(&mut state);
                false
            }
        }
    }

    pub fn set_mode(&self, sensor: &str, severity: Severity, enabled: bool) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        let Some(service) = state.service.as_ref() else {
            return;
        };
        let hint = hint_name(sensor, severity);
        info!(hint = %hint, enabled, "Send hint");
        if let Err(e) = service.set_mode(&hint, enabled) {
            error!(hint = %hint, error = %e, "Fail to set mode");
            Self::drop_service(&mut state);
        }
    }

    fn drop_service(state: &mut ClientState) {
        state.service = None;
        state.exist = false;
        state.connected = false;
    }
}

impl Default for PowerHalClient {
    fn default() -> Self {
        Self::disconnected()
    }
}
