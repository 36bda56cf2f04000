//! # Object Metadata
//!
//! Per-type telemetry metadata: how and when an object is sent to the
//! flight controller.

use serde::Deserialize;

/// GCS-side update mode of an object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Send at a fixed interval driven by the update wheel
    Periodic,
    /// Send whenever the object data changes
    OnChange,
    /// Send on change, at most once per update period
    Throttled,
    /// Send only on explicit user action
    Manual,
}

/// Telemetry metadata shared by all instances of an object type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Update mode for GCS-to-FC traffic
    pub update_mode: UpdateMode,

    /// Update period in milliseconds (meaningful for Periodic and Throttled)
    pub update_period_ms: u32,

    /// Whether transmissions must be acknowledged by the peer
    pub acked: bool,
}

impl Metadata {
    /// Metadata for a periodic object
    pub fn periodic(update_period_ms: u32, acked: bool) -> Self {
        Self {
            update_mode: UpdateMode::Periodic,
            update_period_ms,
            acked,
        }
    }

    /// Metadata for an on-change object
    pub fn on_change(acked: bool) -> Self {
        Self {
            update_mode: UpdateMode::OnChange,
            update_period_ms: 0,
            acked,
        }
    }

    /// Metadata for a throttled object
    pub fn throttled(update_period_ms: u32, acked: bool) -> Self {
        Self {
            update_mode: UpdateMode::Throttled,
            update_period_ms,
            acked,
        }
    }

    /// Metadata for a manually updated object
    pub fn manual(acked: bool) -> Self {
        Self {
            update_mode: UpdateMode::Manual,
            update_period_ms: 0,
            acked,
        }
    }
}
