//! # Object Registry
//!
//! Catalog of all object types known to the GCS. Registering a data object
//! also creates its meta-object sibling; both are announced to subscribers
//! so the telemetry engine can bind to objects that appear at runtime.

use super::metadata::Metadata;
use super::object::{ObjId, UavObject};
use crate::error::{GcsTelemetryError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Catalog change notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new object type was registered (fired for data and meta objects)
    NewObject(Arc<UavObject>),
    /// A new instance of an existing type was created
    NewInstance(Arc<UavObject>),
}

#[derive(Default)]
struct Inner {
    /// Type ids in registration order, for stable enumeration
    order: Vec<ObjId>,
    /// All instances per type, ordered by instance id
    instances: HashMap<ObjId, Vec<Arc<UavObject>>>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn announce(&mut self, event: RegistryEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Thread-safe object catalog
#[derive(Default)]
pub struct ObjectRegistry {
    inner: Mutex<Inner>,
}

impl ObjectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new object type.
    ///
    /// Creates instance 0 of the data object plus its meta-object sibling
    /// (id + 1) and announces both. Fails if either id is already taken.
    pub fn register(&self, name: &str, id: ObjId, metadata: Metadata) -> Result<Arc<UavObject>> {
        let mut inner = self.inner.lock();

        if inner.instances.contains_key(&id) {
            return Err(GcsTelemetryError::DuplicateObject(id));
        }
        if inner.instances.contains_key(&id.meta_id()) {
            return Err(GcsTelemetryError::DuplicateObject(id.meta_id()));
        }

        let object = UavObject::new_data(
            id,
            name,
            0,
            Arc::new(parking_lot::RwLock::new(metadata)),
        );
        let meta = UavObject::new_meta(&object);
        debug!(object = name, id = %id, "registered object type");

        inner.order.push(id);
        inner.instances.insert(id, vec![Arc::clone(&object)]);
        inner.order.push(meta.id());
        inner.instances.insert(meta.id(), vec![Arc::clone(&meta)]);

        inner.announce(RegistryEvent::NewObject(Arc::clone(&object)));
        inner.announce(RegistryEvent::NewObject(meta));

        Ok(object)
    }

    /// Create a new instance of an already-registered data object type
    pub fn add_instance(&self, id: ObjId) -> Result<Arc<UavObject>> {
        let mut inner = self.inner.lock();

        let Some(instances) = inner.instances.get_mut(&id) else {
            return Err(GcsTelemetryError::UnknownObject(id));
        };
        let Some(canonical) = instances.first().cloned() else {
            return Err(GcsTelemetryError::UnknownObject(id));
        };
        if canonical.is_meta() {
            // Meta-objects are singletons
            return Err(GcsTelemetryError::UnknownObject(id));
        }

        let instance = UavObject::new_data(
            id,
            canonical.name(),
            instances.len() as u16,
            canonical.metadata_cell(),
        );
        instances.push(Arc::clone(&instance));
        debug!(object = canonical.name(), id = %id, instance = instance.instance(), "new instance");

        inner.announce(RegistryEvent::NewInstance(Arc::clone(&instance)));
        Ok(instance)
    }

    /// One canonical handle (instance 0) per registered type, in
    /// registration order, meta-objects included
    pub fn objects(&self) -> Vec<Arc<UavObject>> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.instances.get(id))
            .filter_map(|instances| instances.first())
            .cloned()
            .collect()
    }

    /// All instances of one type, ordered by instance id
    pub fn instances(&self, id: ObjId) -> Vec<Arc<UavObject>> {
        self.inner.lock().instances.get(&id).cloned().unwrap_or_default()
    }

    /// Canonical handle for a type, if registered
    pub fn get(&self, id: ObjId) -> Option<Arc<UavObject>> {
        self.inner
            .lock()
            .instances
            .get(&id)
            .and_then(|instances| instances.first())
            .cloned()
    }

    /// Subscribe to catalog change notifications
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }
}
