//! WebSocket message types
//!
//! Defines the outgoing commands and incoming frames exchanged with the
//! platform's WebSocket API. Frames the client does not understand fail
//! to parse and are skipped by the connection loop.

use habot_core::{EntityId, EntityState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Command sent by the client. Every command except `Auth` carries a
/// monotonically increasing `id` used to pair the result frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        id: u64,
        event_type: String,
    },
    GetStates {
        id: u64,
    },
    #[serde(rename = "config/floor_registry/list")]
    FloorRegistryList {
        id: u64,
    },
    #[serde(rename = "config/area_registry/list")]
    AreaRegistryList {
        id: u64,
    },
    #[serde(rename = "config/device_registry/list")]
    DeviceRegistryList {
        id: u64,
    },
    #[serde(rename = "config/entity_registry/list")]
    EntityRegistryList {
        id: u64,
    },
    Ping {
        id: u64,
    },
}

// =============================================================================
// Incoming Messages
// =============================================================================

/// Frame received from the platform
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<CommandError>,
    },
    Event {
        id: u64,
        event: EventFrame,
    },
    Pong {
        id: u64,
    },
}

/// Error payload inside a failed result frame
#[derive(Debug, Clone, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

/// Event payload inside an event frame
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a `state_changed` event.
///
/// `new_state` is absent when the entity was removed, `old_state` when
/// it first appeared.
#[derive(Debug, Clone, Deserialize)]
pub struct StateChangedData {
    pub entity_id: EntityId,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

/// Which registry a list command or update event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Floor,
    Area,
    Device,
    Entity,
}

impl RegistryKind {
    /// Map a registry-updated event type back to its registry.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "floor_registry_updated" => Some(Self::Floor),
            "area_registry_updated" => Some(Self::Area),
            "device_registry_updated" => Some(Self::Device),
            "entity_registry_updated" => Some(Self::Entity),
            _ => None,
        }
    }

    pub fn list_command(self, id: u64) -> ClientMessage {
        match self {
            Self::Floor => ClientMessage::FloorRegistryList { id },
            Self::Area => ClientMessage::AreaRegistryList { id },
            Self::Device => ClientMessage::DeviceRegistryList { id },
            Self::Entity => ClientMessage::EntityRegistryList { id },
        }
    }

    pub const ALL: [RegistryKind; 4] = [Self::Floor, Self::Area, Self::Device, Self::Entity];
}

/// One complete set of registry listings, fetched in a single batch.
#[derive(Debug, Clone, Default)]
pub struct RegistryDump {
    pub floors: Vec<Value>,
    pub areas: Vec<Value>,
    pub devices: Vec<Value>,
    pub entities: Vec<Value>,
}

impl RegistryDump {
    pub fn set(&mut self, kind: RegistryKind, rows: Vec<Value>) {
        match kind {
            RegistryKind::Floor => self.floors = rows,
            RegistryKind::Area => self.areas = rows,
            RegistryKind::Device => self.devices = rows,
            RegistryKind::Entity => self.entities = rows,
        }
    }
}

/// Event types the client subscribes to after authenticating
pub const SUBSCRIBED_EVENT_TYPES: [&str; 5] = [
    "state_changed",
    "floor_registry_updated",
    "area_registry_updated",
    "device_registry_updated",
    "entity_registry_updated",
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_message_serialization() {
        let msg = ClientMessage::Auth {
            access_token: "tok".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "auth", "access_token": "tok"})
        );
    }

    #[test]
    fn test_registry_list_command_types() {
        let msg = RegistryKind::Floor.list_command(7);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "config/floor_registry/list", "id": 7})
        );
    }

    #[test]
    fn test_result_frame_deserialization() {
        let frame: ServerMessage = serde_json::from_str(
            r#"{"id": 3, "type": "result", "success": true, "result": [{"floor_id": "ground"}]}"#,
        )
        .unwrap();
        match frame {
            ServerMessage::Result {
                id,
                success,
                result,
                ..
            } => {
                assert_eq!(id, 3);
                assert!(success);
                assert_eq!(result.unwrap()[0]["floor_id"], "ground");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_state_changed_event_deserialization() {
        let frame: ServerMessage = serde_json::from_str(
            r#"{
                "id": 1,
                "type": "event",
                "event": {
                    "event_type": "state_changed",
                    "data": {
                        "entity_id": "vacuum.roborock",
                        "old_state": null,
                        "new_state": {
                            "entity_id": "vacuum.roborock",
                            "state": "cleaning",
                            "attributes": {"battery_level": 84},
                            "last_changed": "2024-06-01T10:00:00+00:00",
                            "last_updated": "2024-06-01T10:00:00+00:00"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        let ServerMessage::Event { event, .. } = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event.event_type, "state_changed");

        let data: StateChangedData = serde_json::from_value(event.data).unwrap();
        assert!(data.old_state.is_none());
        let new = data.new_state.unwrap();
        assert_eq!(new.state, "cleaning");
        assert_eq!(new.attribute::<u8>("battery_level"), Some(84));
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let parsed: Result<ServerMessage, _> =
            serde_json::from_str(r#"{"type": "zones/list", "id": 1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_registry_kind_from_event_type() {
        assert_eq!(
            RegistryKind::from_event_type("area_registry_updated"),
            Some(RegistryKind::Area)
        );
        assert_eq!(RegistryKind::from_event_type("state_changed"), None);
    }
}
