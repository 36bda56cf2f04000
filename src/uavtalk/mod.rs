//! # UAVTalk Link Abstraction
//!
//! Trait boundary between the telemetry engine and the UAVTalk wire codec.
//! Framing, CRC and serialization live behind this trait; the engine only
//! issues sends/requests/cancels and receives completion callbacks through
//! its handle.

mod loopback;

pub use loopback::LoopbackLink;

use crate::objects::UavObject;
use std::sync::Arc;

/// GCS-to-flight-controller handshake status.
///
/// The handshake state machine itself is external to the engine; telemetry
/// only reads the current status to gate traffic while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    HandshakeRequested,
    HandshakeAcknowledged,
    Connected,
}

/// Counters maintained by the wire codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_object_bytes: u64,
    pub rx_object_bytes: u64,
    pub rx_objects: u32,
    pub tx_objects: u32,
    pub tx_errors: u32,
    pub rx_errors: u32,
}

/// Operations the telemetry engine requires from the UAVTalk codec.
///
/// Calls are issued from the engine task and must not block; a codec
/// implementation enqueues the frame and returns. Transaction outcomes are
/// reported back through `TelemetryHandle::transaction_completed`.
pub trait UavTalkLink: Send + Sync {
    /// Transmit an object, optionally requesting an acknowledgement
    fn send_object(&self, object: &Arc<UavObject>, acked: bool, all_instances: bool);

    /// Request an object from the peer
    fn send_object_request(&self, object: &Arc<UavObject>, all_instances: bool);

    /// Abort the pending transaction for an object
    fn cancel_transaction(&self, object: &Arc<UavObject>);

    /// Snapshot of the codec's counters
    fn stats(&self) -> LinkStats;

    /// Zero the codec's counters
    fn reset_stats(&self);
}
