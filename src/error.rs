//! # Error Types
//!
//! Custom error types for the GCS telemetry engine using `thiserror`.

use crate::objects::ObjId;
use thiserror::Error;

/// Main error type for the telemetry engine
#[derive(Debug, Error)]
pub enum GcsTelemetryError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An object with the same id is already registered
    #[error("Duplicate object id {0}")]
    DuplicateObject(ObjId),

    /// No object with this id is registered
    #[error("Unknown object id {0}")]
    UnknownObject(ObjId),

    /// The telemetry engine task has stopped
    #[error("Telemetry engine is not running")]
    EngineStopped,
}

/// Result type alias for the telemetry engine
pub type Result<T> = std::result::Result<T, GcsTelemetryError>;
