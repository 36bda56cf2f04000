//! # Object Handles
//!
//! `UavObject` is the handle the telemetry engine schedules: a typed,
//! versioned record identified by a 32-bit object id, possibly with
//! multiple instances. Every data object has a meta-object sibling whose
//! payload is the data object's metadata.

use super::metadata::{Metadata, UpdateMode};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Stable 32-bit object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct ObjId(pub u32);

impl ObjId {
    /// Id of the meta-object sibling of a data object
    pub const fn meta_id(self) -> ObjId {
        ObjId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Metadata carried by every meta-object: sent on change, unacknowledged.
pub(crate) const META_OBJECT_METADATA: Metadata = Metadata {
    update_mode: UpdateMode::OnChange,
    update_period_ms: 0,
    acked: false,
};

/// Data object or meta-object, as a tagged variant
enum ObjectKind {
    Data,
    Meta { parent: Weak<UavObject> },
}

/// A single instance of an object type.
///
/// Instances of the same type share one metadata record; the telemetry
/// engine keys all scheduling state by `ObjId`, so per-instance handles
/// exist only to route events.
pub struct UavObject {
    id: ObjId,
    name: String,
    instance: u16,
    metadata: Arc<RwLock<Metadata>>,
    kind: ObjectKind,
    completion_listeners: Mutex<Vec<mpsc::UnboundedSender<bool>>>,
}

impl UavObject {
    /// Create a data object instance sharing `metadata` with its siblings
    pub(crate) fn new_data(
        id: ObjId,
        name: &str,
        instance: u16,
        metadata: Arc<RwLock<Metadata>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            instance,
            metadata,
            kind: ObjectKind::Data,
            completion_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Create the meta-object sibling of `parent`
    pub(crate) fn new_meta(parent: &Arc<UavObject>) -> Arc<Self> {
        Arc::new(Self {
            id: parent.id.meta_id(),
            name: format!("{}Meta", parent.name),
            instance: 0,
            metadata: Arc::new(RwLock::new(META_OBJECT_METADATA)),
            kind: ObjectKind::Meta {
                parent: Arc::downgrade(parent),
            },
            completion_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }

    /// Snapshot of the type's metadata
    pub fn metadata(&self) -> Metadata {
        *self.metadata.read()
    }

    /// Replace the type's metadata (all instances observe the change)
    pub fn set_metadata(&self, metadata: Metadata) {
        *self.metadata.write() = metadata;
    }

    /// Shared metadata cell, used when cloning a new instance of the type
    pub(crate) fn metadata_cell(&self) -> Arc<RwLock<Metadata>> {
        Arc::clone(&self.metadata)
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.kind, ObjectKind::Meta { .. })
    }

    /// For a meta-object, the data object whose metadata it carries.
    ///
    /// Returns `None` for data objects, and for a meta-object whose parent
    /// has been dropped.
    pub fn parent_object(&self) -> Option<Arc<UavObject>> {
        match &self.kind {
            ObjectKind::Data => None,
            ObjectKind::Meta { parent } => parent.upgrade(),
        }
    }

    /// Subscribe to transaction results for this object handle.
    ///
    /// Every completed or failed transaction emits one `bool` (success).
    pub fn subscribe_transactions(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.completion_listeners.lock().push(tx);
        rx
    }

    /// Emit a transaction result to all live subscribers
    pub(crate) fn notify_transaction(&self, success: bool) {
        self.completion_listeners
            .lock()
            .retain(|listener| listener.send(success).is_ok());
    }
}

impl fmt::Debug for UavObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UavObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("meta", &self.is_meta())
            .finish()
    }
}
