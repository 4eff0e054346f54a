//! Registry sync engine
//!
//! Builds a fresh snapshot from a full registry dump, diffs it against
//! the previous generation, and publishes it with an atomic swap. Live
//! entity states are patched incrementally from the event stream with
//! last-write-wins semantics.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use habot_core::{EntityId, EntityState};
use habot_stream::{RegistryDump, StateChangedData};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::snapshot::{RegistrySnapshot, SyncDiff};

/// How often a full resync is performed when nothing else triggers one
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// A sync whose payload cannot be trusted. The previous snapshot stays
/// installed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} listing rejected: {skipped} of {total} rows malformed")]
    MalformedListing {
        kind: &'static str,
        skipped: usize,
        total: usize,
    },
}

/// Holds the current snapshot generation plus the live state table
pub struct RegistryEngine {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    states: DashMap<EntityId, EntityState>,
}

impl RegistryEngine {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            states: DashMap::new(),
        }
    }

    /// The current generation. Readers keep the `Arc` and never observe
    /// a half-applied sync.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        read_lock(&self.snapshot).clone()
    }

    /// Install the result of a full sync: build, diff, swap.
    ///
    /// `state_rows` seeds the live state table; rows for entities absent
    /// from the new snapshot are dropped, as are state cells of entities
    /// that disappeared. A dump in which half or more of any listing is
    /// unparseable is rejected outright: installing the remainder would
    /// masquerade as mass entity removal and cascade into subscription
    /// pruning.
    pub fn install(&self, dump: &RegistryDump, state_rows: Vec<Value>) -> Result<SyncDiff, SyncError> {
        let old = self.snapshot();
        let generation = old.generation + 1;
        let (new, skipped) = RegistrySnapshot::from_rows(
            generation,
            &dump.floors,
            &dump.areas,
            &dump.devices,
            &dump.entities,
        );
        check_listing("floor", dump.floors.len(), skipped.floors)?;
        check_listing("area", dump.areas.len(), skipped.areas)?;
        check_listing("device", dump.devices.len(), skipped.devices)?;
        check_listing("entity", dump.entities.len(), skipped.entities)?;
        if skipped.total() > 0 {
            warn!(skipped = skipped.total(), "registry sync skipped malformed rows");
        }
        let diff = new.diff_from(&old);

        let mut seeded = 0usize;
        for row in state_rows {
            match serde_json::from_value::<EntityState>(row) {
                Ok(state) => {
                    if new.contains_entity(&state.entity_id) {
                        self.states.insert(state.entity_id.clone(), state);
                        seeded += 1;
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed state row"),
            }
        }
        self.states.retain(|id, _| new.contains_entity(id));

        let new = Arc::new(new);
        *write_lock(&self.snapshot) = new.clone();

        info!(
            generation,
            entities = new.entity_count(),
            states = seeded,
            entities_added = diff.entities.added,
            entities_removed = diff.entities.removed,
            entities_changed = diff.entities.changed,
            areas_added = diff.areas.added,
            areas_removed = diff.areas.removed,
            "registry sync installed"
        );
        Ok(diff)
    }

    /// Patch one entity's state cell from a stream event. Unknown
    /// entities are skipped: the registry is simply lagging behind and
    /// the next sync will pick them up.
    pub fn apply_state_event(&self, event: &StateChangedData) {
        if !self.snapshot().contains_entity(&event.entity_id) {
            debug!(entity = %event.entity_id, "state event for unknown entity ignored");
            return;
        }
        match &event.new_state {
            Some(new_state) => {
                self.states
                    .insert(event.entity_id.clone(), new_state.clone());
            }
            None => {
                self.states.remove(&event.entity_id);
            }
        }
    }

    pub fn state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.states.get(entity_id).map(|s| s.value().clone())
    }

    /// User-facing name: registry name, else original name, else the id.
    pub fn display_name(&self, entity_id: &EntityId) -> String {
        let snapshot = self.snapshot();
        snapshot
            .entity(entity_id)
            .map(|e| e.display_name())
            .unwrap_or_else(|| entity_id.to_string())
    }
}

impl Default for RegistryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_listing(kind: &'static str, total: usize, skipped: usize) -> Result<(), SyncError> {
    if skipped > 0 && skipped * 2 >= total {
        return Err(SyncError::MalformedListing {
            kind,
            skipped,
            total,
        });
    }
    Ok(())
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dump() -> RegistryDump {
        let mut dump = RegistryDump::default();
        dump.floors = vec![json!({"floor_id": "ground", "name": "Ground"})];
        dump.areas = vec![json!({"area_id": "office", "name": "Office", "floor_id": "ground"})];
        dump.devices = vec![json!({"id": "dev1", "area_id": "office"})];
        dump.entities = vec![
            json!({"entity_id": "light.desk", "device_id": "dev1"}),
            json!({"entity_id": "vacuum.roborock"}),
        ];
        dump
    }

    fn state_row(entity_id: &str, state: &str) -> Value {
        json!({
            "entity_id": entity_id,
            "state": state,
            "attributes": {},
            "last_changed": "2024-06-01T10:00:00Z",
            "last_updated": "2024-06-01T10:00:00Z"
        })
    }

    fn event(entity_id: &str, state: &str) -> StateChangedData {
        serde_json::from_value(json!({
            "entity_id": entity_id,
            "new_state": state_row(entity_id, state),
        }))
        .unwrap()
    }

    #[test]
    fn test_install_seeds_states_for_known_entities_only() {
        let engine = RegistryEngine::new();
        let diff = engine
            .install(
                &dump(),
                vec![
                    state_row("light.desk", "on"),
                    state_row("light.phantom", "off"),
                ],
            )
            .unwrap();
        assert_eq!(diff.entities.added, 2);

        let desk: EntityId = "light.desk".parse().unwrap();
        let phantom: EntityId = "light.phantom".parse().unwrap();
        assert_eq!(engine.state(&desk).unwrap().state, "on");
        assert!(engine.state(&phantom).is_none());
    }

    #[test]
    fn test_apply_state_event_is_last_write_wins_and_idempotent() {
        let engine = RegistryEngine::new();
        engine
            .install(&dump(), vec![state_row("light.desk", "off")])
            .unwrap();
        let desk: EntityId = "light.desk".parse().unwrap();

        let ev = event("light.desk", "on");
        engine.apply_state_event(&ev);
        engine.apply_state_event(&ev);
        assert_eq!(engine.state(&desk).unwrap().state, "on");
    }

    #[test]
    fn test_unknown_entity_event_is_ignored() {
        let engine = RegistryEngine::new();
        engine.install(&dump(), vec![]).unwrap();

        engine.apply_state_event(&event("light.future", "on"));
        let future: EntityId = "light.future".parse().unwrap();
        assert!(engine.state(&future).is_none());
    }

    #[test]
    fn test_resync_drops_states_of_removed_entities() {
        let engine = RegistryEngine::new();
        engine
            .install(&dump(), vec![state_row("vacuum.roborock", "docked")])
            .unwrap();

        let mut smaller = dump();
        smaller.entities = vec![json!({"entity_id": "light.desk", "device_id": "dev1"})];
        let diff = engine.install(&smaller, vec![]).unwrap();

        let vacuum: EntityId = "vacuum.roborock".parse().unwrap();
        assert_eq!(
            diff.removed_entities,
            vec!["vacuum.roborock".parse::<EntityId>().unwrap()]
        );
        assert!(engine.state(&vacuum).is_none());
    }

    /// A dump whose entity listing is garbled must not replace a good
    /// snapshot: doing so would read as mass removal and cascade into
    /// subscription pruning.
    #[test]
    fn test_garbled_sync_keeps_previous_snapshot() {
        let engine = RegistryEngine::new();
        engine
            .install(&dump(), vec![state_row("light.desk", "on")])
            .unwrap();
        assert_eq!(engine.snapshot().entity_count(), 2);

        let mut garbled = dump();
        garbled.entities = vec![
            json!({"entity_id": "not-an-entity-id"}),
            json!({"no_entity_id_at_all": true}),
        ];
        let err = engine.install(&garbled, vec![]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::MalformedListing { kind: "entity", skipped: 2, total: 2 }
        ));

        // previous generation, its entities and its states all survive
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.entity_count(), 2);
        let desk: EntityId = "light.desk".parse().unwrap();
        assert_eq!(engine.state(&desk).unwrap().state, "on");
    }

    /// One bad row in an otherwise healthy listing is still just skipped.
    #[test]
    fn test_single_bad_row_does_not_reject_the_sync() {
        let engine = RegistryEngine::new();
        let mut mostly_good = dump();
        mostly_good.entities.push(json!({"entity_id": "not-an-entity-id"}));
        let diff = engine.install(&mostly_good, vec![]).unwrap();
        assert_eq!(diff.entities.added, 2);
    }

    #[test]
    fn test_readers_keep_old_generation_across_swap() {
        let engine = RegistryEngine::new();
        engine.install(&dump(), vec![]).unwrap();
        let held = engine.snapshot();
        assert_eq!(held.generation, 1);

        engine.install(&dump(), vec![]).unwrap();
        assert_eq!(held.generation, 1);
        assert_eq!(engine.snapshot().generation, 2);
    }
}
