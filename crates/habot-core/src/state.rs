//! Entity state value with attributes and change timestamps

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// The live state of one entity as last reported by the platform.
///
/// Updates are last-write-wins per field: applying the same event twice,
/// or applying two events out of order, converges on the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g. "on", "docked", "23.5", "unavailable")
    pub state: String,

    /// Attribute map reported alongside the state value
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed to a different value
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value was identical
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    /// Create a fresh state with the current timestamp.
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// True if the platform reports the entity as unreachable.
    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable" || self.state == "unknown"
    }

    /// Typed attribute lookup.
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Best display name: `friendly_name` attribute, else the raw id.
    pub fn friendly_name(&self) -> String {
        self.attribute::<String>("friendly_name")
            .unwrap_or_else(|| self.entity_id.to_string())
    }
}

impl PartialEq for EntityState {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared: two reports of the same value are
        // the same state for dedup purposes.
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
