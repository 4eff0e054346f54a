//! Registry mirror: floors, areas, devices, entities and live state
//!
//! The platform remains the source of truth; this crate keeps a local,
//! immutable snapshot of its registries plus a live state table patched
//! from the event stream. Syncs publish atomically, so every query
//! answers from one consistent generation.

mod engine;
mod records;
mod snapshot;

pub use engine::{RegistryEngine, SyncError, RESYNC_INTERVAL};
pub use records::{AreaRecord, DeviceRecord, EntityCategory, EntityRecord, FloorRecord};
pub use snapshot::{DiffCounts, RegistrySnapshot, RowSkips, SyncDiff};
