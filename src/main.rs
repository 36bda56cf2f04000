//! # GCS Telemetry
//!
//! Demo ground-control-station loop: loads the object catalog from the
//! configuration file, runs the telemetry engine against a simulated
//! flight controller, and reports link statistics until interrupted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod objects;
mod telemetry;
mod uavtalk;

use config::Config;
use objects::ObjectRegistry;
use telemetry::Telemetry;
use uavtalk::{ConnectionStatus, LoopbackLink, UavTalkLink};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let (config, config_error) = match Config::load(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Initialize logging (RUST_LOG overrides the configured filter)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.filter.clone())),
        )
        .init();

    info!("GCS telemetry v{} starting...", env!("CARGO_PKG_VERSION"));
    match config_error {
        Some(e) => warn!("Failed to load {config_path}: {e}; using built-in defaults"),
        None => info!("Loaded configuration from {config_path}"),
    }

    // Build the object catalog
    let registry = ObjectRegistry::new();
    for entry in &config.catalog {
        let obj = registry.register(&entry.name, entry.id, entry.metadata())?;
        info!(object = obj.name(), id = %obj.id(), mode = ?entry.mode, "registered");
    }

    // Simulated flight controller standing in for the wire codec
    let link = LoopbackLink::new(config.link.ack_delay_ms, config.link.drop_every);

    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
    let (engine, handle) = Telemetry::new(
        Arc::clone(&registry),
        Arc::clone(&link) as Arc<dyn UavTalkLink>,
        status_rx,
        config.engine.rng_seed,
    );
    link.attach(handle.clone());
    let engine_task = tokio::spawn(engine.run());

    // Walk the handshake; the real state machine lives outside the engine
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = status_tx.send(ConnectionStatus::HandshakeRequested);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = status_tx.send(ConnectionStatus::HandshakeAcknowledged);
        tokio::time::sleep(Duration::from_millis(500)).await;
        info!("flight controller connected");
        let _ = status_tx.send(ConnectionStatus::Connected);
        // Keep the sender alive for the lifetime of the process
        std::future::pending::<()>().await;
    });

    // Periodic stats report
    let stats_handle = handle.clone();
    let report_interval = Duration::from_millis(config.stats.report_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(report_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match stats_handle.stats().await {
                Ok(stats) => info!(
                    tx_objects = stats.tx_objects,
                    rx_objects = stats.rx_objects,
                    tx_bytes = stats.tx_bytes,
                    rx_bytes = stats.rx_bytes,
                    tx_retries = stats.tx_retries,
                    tx_errors = stats.tx_errors,
                    "link statistics"
                ),
                Err(_) => break,
            }
        }
    });

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    handle.shutdown();
    let _ = engine_task.await;

    Ok(())
}
