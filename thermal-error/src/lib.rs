//! Unified error handling for the thermal service
//!
//! This crate provides the single error type shared by the configuration
//! loader, the sysfs file layer, the power-rail sampler and the query facade.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using ThermalError
pub type Result<T> = std::result::Result<T, ThermalError>;

/// Unified error type for all thermal service operations
#[derive(thiserror::Error, Debug)]
pub enum ThermalError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("No file registered for {0}")]
    FileNotRegistered(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName {
        kind: &'static str,
        name: String,
    },

    #[error("Virtual sensor cycle detected through {0}")]
    VirtualSensorCycle(String),

    // ============================================================================
    // Sensor and Device Errors
    // ============================================================================
    #[error("Failed to parse value {value:?} from {name}")]
    InvalidReading {
        name: String,
        value: String,
    },

    #[error("Virtual sensor {0} could not be evaluated")]
    VirtualSensor(String),

    // ============================================================================
    // Notification and Power Hint Errors
    // ============================================================================
    #[error("Same callback registered already")]
    CallbackAlreadyRegistered,

    #[error("The callback was not registered before")]
    CallbackNotRegistered,

    #[error("Power hint service error: {0}")]
    PowerHint(String),

    // ============================================================================
    // Service Errors
    // ============================================================================
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("{0}")]
    Generic(String),
}

impl ThermalError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid configuration error for a named field
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an initialization error from a string
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// True for errors caused by the configuration document itself
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::JsonParse(_)
                | Self::InvalidConfig { .. }
                | Self::MissingConfig(_)
                | Self::DuplicateName { .. }
                | Self::VirtualSensorCycle(_)
        )
    }
}

// Allow converting from String to ThermalError
impl From<String> for ThermalError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ThermalError
impl From<&str> for ThermalError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(ThermalError::config("bad").is_config_error());
        assert!(ThermalError::invalid("HotThreshold", "size").is_config_error());
        assert!(!ThermalError::CallbackNotRegistered.is_config_error());
        assert!(!ThermalError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_config_error());
    }

    #[test]
    fn test_display_messages() {
        let err = ThermalError::DuplicateName { kind: "Sensor", name: "skin".into() };
        assert_eq!(err.to_string(), "Duplicate Sensor name: skin");
        assert_eq!(
            ThermalError::CallbackAlreadyRegistered.to_string(),
            "Same callback registered already"
        );
    }
}
