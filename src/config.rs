//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! The engine's retry/timeout constants are compile-time tunables; the
//! configuration covers the startup surface: logging, stats reporting, the
//! loopback link behavior, the RNG seed and the object catalog.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::objects::{Metadata, ObjId, UpdateMode, GCS_TELEMETRY_STATS};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default = "default_catalog")]
    pub catalog: Vec<CatalogEntry>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Stats reporting configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

/// Loopback link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,

    /// Swallow every Nth response to exercise the retry path (0 = never)
    #[serde(default)]
    pub drop_every: u32,
}

/// Engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Seed for the periodic phase de-bunching RNG
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
}

/// One object type in the catalog
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub id: ObjId,
    pub mode: UpdateMode,

    #[serde(default)]
    pub period_ms: u32,

    #[serde(default)]
    pub acked: bool,
}

impl CatalogEntry {
    /// Telemetry metadata for this entry
    pub fn metadata(&self) -> Metadata {
        Metadata {
            update_mode: self.mode,
            update_period_ms: self.period_ms,
            acked: self.acked,
        }
    }
}

// Default value functions
fn default_log_filter() -> String { "info".to_string() }
fn default_report_interval_ms() -> u64 { 5000 }
fn default_ack_delay_ms() -> u64 { 20 }
fn default_rng_seed() -> u64 { 0 }

fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            name: "GCSTelemetryStats".to_string(),
            id: GCS_TELEMETRY_STATS,
            mode: UpdateMode::Periodic,
            period_ms: 5000,
            acked: false,
        },
        CatalogEntry {
            name: "FlightStatus".to_string(),
            id: ObjId(0x0A14_2F60),
            mode: UpdateMode::Periodic,
            period_ms: 1000,
            acked: false,
        },
        CatalogEntry {
            name: "AttitudeState".to_string(),
            id: ObjId(0x6B92_0D30),
            mode: UpdateMode::Periodic,
            period_ms: 100,
            acked: false,
        },
        CatalogEntry {
            name: "GPSPositionSensor".to_string(),
            id: ObjId(0x3F88_1C10),
            mode: UpdateMode::Throttled,
            period_ms: 500,
            acked: false,
        },
        CatalogEntry {
            name: "SystemSettings".to_string(),
            id: ObjId(0x55E1_0A90),
            mode: UpdateMode::OnChange,
            period_ms: 0,
            acked: true,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            stats: StatsConfig::default(),
            link: LinkConfig::default(),
            engine: EngineConfig::default(),
            catalog: default_catalog(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { report_interval_ms: default_report_interval_ms() }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { ack_delay_ms: default_ack_delay_ms(), drop_every: 0 }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { rng_seed: default_rng_seed() }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.log.filter.is_empty() {
            return Err(crate::error::GcsTelemetryError::Config(
                toml::de::Error::custom("log filter cannot be empty")
            ));
        }

        if self.stats.report_interval_ms == 0 || self.stats.report_interval_ms > 600_000 {
            return Err(crate::error::GcsTelemetryError::Config(
                toml::de::Error::custom("report_interval_ms must be between 1 and 600000")
            ));
        }

        if self.link.ack_delay_ms > 10_000 {
            return Err(crate::error::GcsTelemetryError::Config(
                toml::de::Error::custom("ack_delay_ms must be at most 10000")
            ));
        }

        if self.link.drop_every == 1 {
            return Err(crate::error::GcsTelemetryError::Config(
                toml::de::Error::custom("drop_every = 1 would swallow every response")
            ));
        }

        if self.catalog.is_empty() {
            return Err(crate::error::GcsTelemetryError::Config(
                toml::de::Error::custom("catalog cannot be empty")
            ));
        }

        for entry in &self.catalog {
            if entry.name.is_empty() {
                return Err(crate::error::GcsTelemetryError::Config(
                    toml::de::Error::custom("catalog entry name cannot be empty")
                ));
            }

            match entry.mode {
                UpdateMode::Periodic | UpdateMode::Throttled => {
                    if entry.period_ms == 0 || entry.period_ms > i32::MAX as u32 {
                        return Err(crate::error::GcsTelemetryError::Config(
                            toml::de::Error::custom(format!(
                                "{}: periodic/throttled objects need a period between 1 and {}",
                                entry.name,
                                i32::MAX
                            ))
                        ));
                    }
                }
                UpdateMode::OnChange | UpdateMode::Manual => {}
            }
        }

        // Ids must be unique, including the derived meta-object ids (id + 1)
        for (index, entry) in self.catalog.iter().enumerate() {
            for other in &self.catalog[index + 1..] {
                let clash = entry.id == other.id
                    || entry.id == other.id.meta_id()
                    || entry.id.meta_id() == other.id;
                if clash {
                    return Err(crate::error::GcsTelemetryError::Config(
                        toml::de::Error::custom(format!(
                            "catalog ids collide: {} ({}) and {} ({})",
                            entry.name, entry.id, other.name, other.id
                        ))
                    ));
                }
            }
        }

        Ok(())
    }
}
