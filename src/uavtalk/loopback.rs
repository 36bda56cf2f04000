//! # Loopback Link
//!
//! A simulated flight controller for running the engine without hardware.
//! Acked sends and object requests are answered with a success completion
//! after a configurable delay; every Nth response can be swallowed to
//! exercise the retry path.

use super::{LinkStats, UavTalkLink};
use crate::objects::UavObject;
use crate::telemetry::TelemetryHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// UAVTalk frame header: sync, type, size, object id, instance id, checksum.
/// The loopback does not serialize payloads, so byte accounting covers
/// headers only.
const FRAME_HEADER_BYTES: u64 = 11;

pub struct LoopbackLink {
    ack_delay: Duration,
    /// Swallow every Nth response (0 = respond to everything)
    drop_every: u32,
    responses: AtomicU32,
    handle: Mutex<Option<TelemetryHandle>>,
    stats: Mutex<LinkStats>,
}

impl LoopbackLink {
    pub fn new(ack_delay_ms: u64, drop_every: u32) -> Arc<Self> {
        Arc::new(Self {
            ack_delay: Duration::from_millis(ack_delay_ms),
            drop_every,
            responses: AtomicU32::new(0),
            handle: Mutex::new(None),
            stats: Mutex::new(LinkStats::default()),
        })
    }

    /// Wire the link to a running engine so completions can be delivered
    pub fn attach(&self, handle: TelemetryHandle) {
        *self.handle.lock() = Some(handle);
    }

    fn swallow_response(&self) -> bool {
        let n = self.responses.fetch_add(1, Ordering::Relaxed) + 1;
        self.drop_every > 0 && n % self.drop_every == 0
    }

    /// Deliver a delayed completion, optionally echoing the object back
    /// first (a request is answered with the object, then settles).
    fn respond(&self, object: &Arc<UavObject>, echo_object: bool) {
        let Some(handle) = self.handle.lock().clone() else {
            return;
        };
        if self.swallow_response() {
            debug!(object = object.name(), "loopback swallowed response");
            return;
        }
        let delay = self.ack_delay;
        let object = Arc::clone(object);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if echo_object {
                handle.object_unpacked(&object);
            }
            handle.transaction_completed(object.id(), true);
        });
        if echo_object {
            let mut stats = self.stats.lock();
            stats.rx_objects += 1;
            stats.rx_bytes += FRAME_HEADER_BYTES;
        }
    }
}

impl UavTalkLink for LoopbackLink {
    fn send_object(&self, object: &Arc<UavObject>, acked: bool, _all_instances: bool) {
        {
            let mut stats = self.stats.lock();
            stats.tx_objects += 1;
            stats.tx_bytes += FRAME_HEADER_BYTES;
        }
        if acked {
            self.respond(object, false);
        }
    }

    fn send_object_request(&self, object: &Arc<UavObject>, _all_instances: bool) {
        self.stats.lock().tx_bytes += FRAME_HEADER_BYTES;
        self.respond(object, true);
    }

    fn cancel_transaction(&self, object: &Arc<UavObject>) {
        debug!(object = object.name(), "loopback transaction cancelled");
    }

    fn stats(&self) -> LinkStats {
        *self.stats.lock()
    }

    fn reset_stats(&self) {
        *self.stats.lock() = LinkStats::default();
    }
}
