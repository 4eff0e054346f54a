//! Immutable registry snapshot and structural diff
//!
//! A snapshot is built in one piece from a full registry dump and never
//! mutated afterwards; readers hold an `Arc` to whichever generation was
//! current when they asked. Area references are validated during the
//! build, so every area id a query resolves to exists in the same
//! snapshot.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use habot_core::EntityId;
use serde_json::Value;
use tracing::warn;

use crate::records::{AreaRecord, DeviceRecord, EntityRecord, FloorRecord};

/// One consistent view of floors, areas, devices and entities
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub generation: u64,
    pub synced_at: Option<DateTime<Utc>>,
    floors: HashMap<String, FloorRecord>,
    areas: HashMap<String, AreaRecord>,
    devices: HashMap<String, DeviceRecord>,
    entities: HashMap<EntityId, EntityRecord>,
}

/// Added/removed/changed counts for one record type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffCounts {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl DiffCounts {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.changed == 0
    }
}

/// Structural difference between two snapshot generations
#[derive(Debug, Default)]
pub struct SyncDiff {
    pub floors: DiffCounts,
    pub areas: DiffCounts,
    pub devices: DiffCounts,
    pub entities: DiffCounts,
    /// Entities present in the old generation but gone from the new one.
    /// Their subscriptions must be pruned.
    pub removed_entities: Vec<EntityId>,
}

impl SyncDiff {
    pub fn is_noop(&self) -> bool {
        self.floors.is_noop()
            && self.areas.is_noop()
            && self.devices.is_noop()
            && self.entities.is_noop()
    }
}

/// Rows dropped while building a snapshot, per listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowSkips {
    pub floors: usize,
    pub areas: usize,
    pub devices: usize,
    pub entities: usize,
}

impl RowSkips {
    pub fn total(&self) -> usize {
        self.floors + self.areas + self.devices + self.entities
    }
}

impl RegistrySnapshot {
    /// Build a snapshot from raw registry listing rows.
    ///
    /// Malformed rows are skipped with a warning; dangling floor and area
    /// references are cleared so that lookups stay inside this snapshot.
    /// Returns the snapshot and the rows skipped per listing, so callers
    /// can decide whether the dump is trustworthy at all.
    pub fn from_rows(
        generation: u64,
        floor_rows: &[Value],
        area_rows: &[Value],
        device_rows: &[Value],
        entity_rows: &[Value],
    ) -> (Self, RowSkips) {
        let mut skipped = RowSkips::default();

        let floors: HashMap<String, FloorRecord> =
            parse_rows(floor_rows, "floor", &mut skipped.floors, |f: &FloorRecord| {
                f.floor_id.clone()
            });
        let mut areas: HashMap<String, AreaRecord> =
            parse_rows(area_rows, "area", &mut skipped.areas, |a: &AreaRecord| {
                a.area_id.clone()
            });
        let mut devices: HashMap<String, DeviceRecord> =
            parse_rows(device_rows, "device", &mut skipped.devices, |d: &DeviceRecord| {
                d.id.clone()
            });
        let mut entities: HashMap<EntityId, EntityRecord> =
            parse_rows(entity_rows, "entity", &mut skipped.entities, |e: &EntityRecord| {
                e.entity_id.clone()
            });

        for area in areas.values_mut() {
            if let Some(floor_id) = &area.floor_id {
                if !floors.contains_key(floor_id) {
                    warn!(area = %area.area_id, floor = %floor_id, "clearing dangling floor reference");
                    area.floor_id = None;
                }
            }
        }
        for device in devices.values_mut() {
            if let Some(area_id) = &device.area_id {
                if !areas.contains_key(area_id) {
                    warn!(device = %device.id, area = %area_id, "clearing dangling area reference");
                    device.area_id = None;
                }
            }
        }
        for entity in entities.values_mut() {
            if let Some(area_id) = &entity.area_id {
                if !areas.contains_key(area_id) {
                    warn!(entity = %entity.entity_id, area = %area_id, "clearing dangling area override");
                    entity.area_id = None;
                }
            }
        }

        (
            Self {
                generation,
                synced_at: Some(Utc::now()),
                floors,
                areas,
                devices,
                entities,
            },
            skipped,
        )
    }

    pub fn floor(&self, floor_id: &str) -> Option<&FloorRecord> {
        self.floors.get(floor_id)
    }

    pub fn area(&self, area_id: &str) -> Option<&AreaRecord> {
        self.areas.get(area_id)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    pub fn entity(&self, entity_id: &EntityId) -> Option<&EntityRecord> {
        self.entities.get(entity_id)
    }

    pub fn contains_entity(&self, entity_id: &EntityId) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    pub fn floors(&self) -> impl Iterator<Item = &FloorRecord> {
        self.floors.values()
    }

    pub fn areas(&self) -> impl Iterator<Item = &AreaRecord> {
        self.areas.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// The area an entity belongs to: its own override if set, else the
    /// area of its owning device. Always resolvable within this snapshot.
    pub fn resolved_area(&self, entity_id: &EntityId) -> Option<&AreaRecord> {
        let entity = self.entities.get(entity_id)?;
        let area_id = entity.area_id.as_deref().or_else(|| {
            entity
                .device_id
                .as_deref()
                .and_then(|d| self.devices.get(d))
                .and_then(|d| d.area_id.as_deref())
        })?;
        self.areas.get(area_id)
    }

    pub fn entities_in_area(&self, area_id: &str, show_all: bool) -> Vec<&EntityRecord> {
        self.sorted(self.entities.values().filter(|e| {
            e.is_visible(show_all)
                && self
                    .resolved_area(&e.entity_id)
                    .is_some_and(|a| a.area_id == area_id)
        }))
    }

    pub fn entities_on_floor(&self, floor_id: &str, show_all: bool) -> Vec<&EntityRecord> {
        self.sorted(self.entities.values().filter(|e| {
            e.is_visible(show_all)
                && self
                    .resolved_area(&e.entity_id)
                    .and_then(|a| a.floor_id.as_deref())
                    .is_some_and(|f| f == floor_id)
        }))
    }

    pub fn entities_in_domain(&self, domain: &str, show_all: bool) -> Vec<&EntityRecord> {
        self.sorted(
            self.entities
                .values()
                .filter(|e| e.is_visible(show_all) && e.entity_id.domain() == domain),
        )
    }

    pub fn entities_of_device(&self, device_id: &str, show_all: bool) -> Vec<&EntityRecord> {
        self.sorted(
            self.entities
                .values()
                .filter(|e| e.is_visible(show_all) && e.device_id.as_deref() == Some(device_id)),
        )
    }

    fn sorted<'a>(&self, iter: impl Iterator<Item = &'a EntityRecord>) -> Vec<&'a EntityRecord> {
        let mut out: Vec<_> = iter.collect();
        out.sort_by_key(|e| (e.display_name(), e.entity_id.to_string()));
        out
    }

    /// Structural diff against an older generation.
    pub fn diff_from(&self, old: &Self) -> SyncDiff {
        let mut removed_entities: Vec<EntityId> = old
            .entities
            .keys()
            .filter(|id| !self.entities.contains_key(*id))
            .cloned()
            .collect();
        removed_entities.sort_by_key(|id| id.to_string());

        SyncDiff {
            floors: diff_maps(&old.floors, &self.floors),
            areas: diff_maps(&old.areas, &self.areas),
            devices: diff_maps(&old.devices, &self.devices),
            entities: diff_maps(&old.entities, &self.entities),
            removed_entities,
        }
    }
}

fn parse_rows<K: Eq + Hash, R: serde::de::DeserializeOwned>(
    rows: &[Value],
    kind: &str,
    skipped: &mut usize,
    key_of: impl Fn(&R) -> K,
) -> HashMap<K, R> {
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<R>(row.clone()) {
            Ok(record) => {
                out.insert(key_of(&record), record);
            }
            Err(e) => {
                *skipped += 1;
                warn!(kind, error = %e, "skipping malformed registry row");
            }
        }
    }
    out
}

fn diff_maps<K: Eq + Hash, V: PartialEq>(old: &HashMap<K, V>, new: &HashMap<K, V>) -> DiffCounts {
    let mut counts = DiffCounts::default();
    for (key, value) in new {
        match old.get(key) {
            None => counts.added += 1,
            Some(previous) if previous != value => counts.changed += 1,
            Some(_) => {}
        }
    }
    counts.removed = old.keys().filter(|k| !new.contains_key(*k)).count();
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> RegistrySnapshot {
        let (snapshot, skipped) = RegistrySnapshot::from_rows(
            1,
            &[json!({"floor_id": "ground", "name": "Ground", "level": 0})],
            &[
                json!({"area_id": "office", "name": "Office", "floor_id": "ground"}),
                json!({"area_id": "kitchen", "name": "Kitchen", "floor_id": "ground"}),
            ],
            &[json!({"id": "dev1", "name": "Hue Bridge", "area_id": "office"})],
            &[
                json!({"entity_id": "light.desk", "device_id": "dev1"}),
                json!({"entity_id": "light.counter", "area_id": "kitchen"}),
                json!({"entity_id": "sensor.desk_signal", "device_id": "dev1",
                       "entity_category": "diagnostic"}),
            ],
        );
        assert_eq!(skipped.total(), 0);
        snapshot
    }

    #[test]
    fn test_area_resolution_override_then_device() {
        let snapshot = fixture();
        let desk: EntityId = "light.desk".parse().unwrap();
        let counter: EntityId = "light.counter".parse().unwrap();

        // desk has no override: falls back to the device's area
        assert_eq!(snapshot.resolved_area(&desk).unwrap().area_id, "office");
        // counter has an explicit override
        assert_eq!(snapshot.resolved_area(&counter).unwrap().area_id, "kitchen");
    }

    #[test]
    fn test_resolved_area_always_in_snapshot() {
        // entity points at an area that does not exist; the reference is
        // cleared at build time and resolution falls back to the device
        let (snapshot, _) = RegistrySnapshot::from_rows(
            1,
            &[],
            &[json!({"area_id": "office", "name": "Office"})],
            &[json!({"id": "dev1", "area_id": "office"})],
            &[json!({"entity_id": "light.desk", "device_id": "dev1", "area_id": "demolished"})],
        );
        let desk: EntityId = "light.desk".parse().unwrap();
        let area = snapshot.resolved_area(&desk).unwrap();
        assert_eq!(area.area_id, "office");
        assert!(snapshot.area(&area.area_id).is_some());
    }

    #[test]
    fn test_queries_filter_diagnostics_unless_show_all() {
        let snapshot = fixture();
        let office = snapshot.entities_in_area("office", false);
        assert_eq!(office.len(), 1);
        assert_eq!(office[0].entity_id.to_string(), "light.desk");

        let office_all = snapshot.entities_in_area("office", true);
        assert_eq!(office_all.len(), 2);
    }

    #[test]
    fn test_floor_query_spans_areas() {
        let snapshot = fixture();
        let ground = snapshot.entities_on_floor("ground", false);
        let ids: Vec<_> = ground.iter().map(|e| e.entity_id.to_string()).collect();
        assert_eq!(ids, vec!["light.counter", "light.desk"]);
    }

    #[test]
    fn test_domain_query() {
        let snapshot = fixture();
        assert_eq!(snapshot.entities_in_domain("light", false).len(), 2);
        assert_eq!(snapshot.entities_in_domain("vacuum", false).len(), 0);
    }

    #[test]
    fn test_malformed_rows_are_skipped_not_fatal() {
        let (snapshot, skipped) = RegistrySnapshot::from_rows(
            1,
            &[],
            &[],
            &[],
            &[
                json!({"entity_id": "light.desk"}),
                json!({"entity_id": "not-an-entity-id"}),
                json!({"no_entity_id_at_all": true}),
            ],
        );
        assert_eq!(skipped.entities, 2);
        assert_eq!(skipped.total(), 2);
        assert_eq!(snapshot.entity_count(), 1);
    }

    #[test]
    fn test_diff_counts_and_removed_entities() {
        let old = fixture();
        let (new, _) = RegistrySnapshot::from_rows(
            2,
            &[json!({"floor_id": "ground", "name": "Ground Floor", "level": 0})],
            &[
                json!({"area_id": "office", "name": "Office", "floor_id": "ground"}),
                json!({"area_id": "kitchen", "name": "Kitchen", "floor_id": "ground"}),
            ],
            &[json!({"id": "dev1", "name": "Hue Bridge", "area_id": "office"})],
            &[
                json!({"entity_id": "light.desk", "device_id": "dev1"}),
                json!({"entity_id": "vacuum.roborock"}),
            ],
        );

        let diff = new.diff_from(&old);
        assert_eq!(diff.floors.changed, 1); // renamed
        assert_eq!(diff.entities.added, 1); // vacuum
        assert_eq!(diff.entities.removed, 2); // counter + diagnostic sensor
        let removed: Vec<_> = diff.removed_entities.iter().map(|e| e.to_string()).collect();
        assert_eq!(removed, vec!["light.counter", "sensor.desk_signal"]);
        assert!(!diff.is_noop());
    }
}
