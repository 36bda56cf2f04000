//! # Subscription Table
//!
//! Subscription records owned by the engine: one event mask per
//! (type, instance). Rebinding an object is a mask write consulted at
//! intake, not a signal connect/disconnect pass over every instance.

use super::events::{EventKind, EventMask};
use crate::objects::{ObjId, UavObject};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    masks: HashMap<(ObjId, u16), EventMask>,
}

impl SubscriptionTable {
    /// Replace the subscription mask on every given instance of one type
    pub fn apply(&mut self, instances: &[Arc<UavObject>], mask: EventMask) {
        for instance in instances {
            self.masks.insert((instance.id(), instance.instance()), mask);
        }
    }

    /// Whether an event from this instance is admitted
    pub fn admits(&self, obj: &UavObject, kind: EventKind) -> bool {
        self.masks
            .get(&(obj.id(), obj.instance()))
            .is_some_and(|mask| mask.contains(kind))
    }

    /// Current mask of one instance (empty if never subscribed)
    pub fn mask(&self, id: ObjId, instance: u16) -> EventMask {
        self.masks.get(&(id, instance)).copied().unwrap_or_default()
    }
}
