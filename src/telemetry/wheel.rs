//! # Periodic Update Wheel
//!
//! One countdown per object type, advanced by a single recurring timer in
//! the engine loop. Entries re-arm drift-free: the countdown overshoot is
//! folded back into the next interval instead of being discarded.

use crate::objects::{ObjId, UavObject};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

struct TimeEntry {
    obj: Arc<UavObject>,
    update_period_ms: u32,
    time_to_next_update_ms: i32,
}

pub(crate) struct UpdateWheel {
    entries: Vec<TimeEntry>,
    /// Interval assumed to have elapsed when a pass runs; emissions made
    /// during the pass push it forward so the scheduler's own cost is
    /// charged against later entries.
    delta_ms: i32,
    rng: SmallRng,
}

impl UpdateWheel {
    pub fn new(seed: u64) -> Self {
        Self {
            entries: Vec::new(),
            delta_ms: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Track a new object type; idempotent per id. The period starts at
    /// zero until the binder installs one.
    pub fn register(&mut self, obj: &Arc<UavObject>) {
        if self.entries.iter().any(|entry| entry.obj.id() == obj.id()) {
            return;
        }
        self.entries.push(TimeEntry {
            obj: Arc::clone(obj),
            update_period_ms: 0,
            time_to_next_update_ms: 0,
        });
    }

    /// Set the update period of one type.
    ///
    /// The countdown is re-seeded with a uniform random phase only when the
    /// period actually changes: types registered at the same instant
    /// de-bunch, while repeated binder passes leave steady-state pacing
    /// untouched.
    pub fn set_period(&mut self, id: ObjId, period_ms: u32) {
        let period_ms = period_ms.min(i32::MAX as u32);
        for entry in &mut self.entries {
            if entry.obj.id() != id || entry.update_period_ms == period_ms {
                continue;
            }
            entry.update_period_ms = period_ms;
            entry.time_to_next_update_ms = if period_ms > 0 {
                self.rng.gen_range(0..period_ms) as i32
            } else {
                0
            };
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Advance one entry by the current delta. Returns the object if its
    /// countdown expired; the entry is re-armed before returning.
    pub fn advance(&mut self, index: usize) -> Option<Arc<UavObject>> {
        let entry = &mut self.entries[index];
        if entry.update_period_ms == 0 {
            return None;
        }
        let period = entry.update_period_ms as i32;
        // Countdowns stay within [-period, period] no matter how late the
        // tick ran, keeping the modulo below well-defined.
        entry.time_to_next_update_ms =
            (entry.time_to_next_update_ms - self.delta_ms).clamp(-period, period);
        if entry.time_to_next_update_ms > 0 {
            return None;
        }
        let offset = (-entry.time_to_next_update_ms) % period;
        entry.time_to_next_update_ms = period - offset;
        Some(Arc::clone(&entry.obj))
    }

    /// Remaining countdown of one entry; `None` when it is not periodic
    pub fn pending_delay(&self, index: usize) -> Option<i32> {
        let entry = &self.entries[index];
        (entry.update_period_ms > 0).then_some(entry.time_to_next_update_ms)
    }

    /// Charge emission cost incurred mid-pass to the elapsed interval
    pub fn add_elapsed(&mut self, elapsed_ms: i32) {
        self.delta_ms = self.delta_ms.saturating_add(elapsed_ms.max(0));
    }

    /// Close a pass: the chosen re-arm interval becomes the next delta
    pub fn set_delta(&mut self, delta_ms: i32) {
        self.delta_ms = delta_ms;
    }

    #[cfg(test)]
    pub fn countdown(&self, id: ObjId) -> Option<i32> {
        self.entries
            .iter()
            .find(|entry| entry.obj.id() == id)
            .map(|entry| entry.time_to_next_update_ms)
    }
}
