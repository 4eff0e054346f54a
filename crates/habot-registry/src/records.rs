//! Registry record types
//!
//! Shapes of the rows returned by the platform's registry list commands.
//! Unknown fields are ignored so newer platform versions keep parsing.

use habot_core::EntityId;
use serde::Deserialize;

/// A floor of the home, grouping areas
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FloorRecord {
    pub floor_id: String,
    pub name: String,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// A room or zone
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AreaRecord {
    pub area_id: String,
    pub name: String,
    #[serde(default)]
    pub floor_id: Option<String>,
    /// Alternative names the area answers to
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// A physical device owning one or more entities
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_by_user: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl DeviceRecord {
    /// User-given name wins over the integration's default.
    pub fn display_name(&self) -> Option<&str> {
        self.name_by_user.as_deref().or(self.name.as_deref())
    }
}

/// Entity category, for visibility filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// One registered entity
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    #[serde(default)]
    pub device_id: Option<String>,
    /// Area override; when absent the owning device's area applies
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub entity_category: Option<EntityCategory>,
    /// Domain-specific capability bitmask reported by the integration
    #[serde(default)]
    pub supported_features: u64,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub hidden_by: Option<String>,
}

impl EntityRecord {
    /// Name for user-facing lists: user name, else the integration's
    /// original name, else the raw entity id.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.original_name.clone())
            .unwrap_or_else(|| self.entity_id.to_string())
    }

    /// Config and diagnostic entities, and anything hidden or disabled,
    /// only show up when `show_all` is requested.
    pub fn is_visible(&self, show_all: bool) -> bool {
        show_all
            || (self.entity_category.is_none()
                && self.hidden_by.is_none()
                && self.disabled_by.is_none())
    }
}
