//! # Object Model
//!
//! The catalog side of the telemetry engine:
//!
//! - Object handles with stable 32-bit ids and optional meta-object siblings
//! - Per-type metadata (update mode, period, ack flag)
//! - A registry with enumeration and new-object/new-instance notifications

mod metadata;
mod object;
mod registry;

pub use metadata::{Metadata, UpdateMode};
pub use object::{ObjId, UavObject};
pub use registry::{ObjectRegistry, RegistryEvent};

/// GCSTelemetryStats: the GCS side of the connection handshake
pub const GCS_TELEMETRY_STATS: ObjId = ObjId(0x5C10_F2A0);

/// OPLinkSettings: radio link configuration
pub const OPLINK_SETTINGS: ObjId = ObjId(0x2E4A_9D10);

/// ObjectPersistence: save/load-to-flash control object
pub const OBJECT_PERSISTENCE: ObjId = ObjId(0x74C1_5B60);
