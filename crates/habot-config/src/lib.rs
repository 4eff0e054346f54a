//! Options-file configuration loading and validation
//!
//! The bridge is configured by a single JSON options file plus an access
//! token taken from the environment. Everything is validated at load time;
//! a bad file is a startup error, never a runtime surprise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use habot_core::{ActionKey, EntityId, UserId};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Environment variable carrying the platform access token.
pub const TOKEN_ENV_VAR: &str = "SUPERVISOR_TOKEN";

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the options file
    #[error("failed to read options file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the options file
    #[error("failed to parse options file {path}: {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A field failed validation
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// The access token environment variable is missing
    #[error("environment variable '{0}' is not set")]
    TokenMissing(&'static str),
}

/// Raw shape of the options file.
#[derive(Debug, Deserialize)]
struct RawOptions {
    #[serde(default)]
    allowed_chat_id: i64,
    #[serde(default)]
    allowed_user_ids: Vec<i64>,
    #[serde(default = "defaults::cooldown_seconds")]
    cooldown_seconds: f64,
    #[serde(default)]
    cooldown_overrides: HashMap<String, f64>,
    #[serde(default = "defaults::rate_limit_actions")]
    global_rate_limit_actions: u32,
    #[serde(default = "defaults::rate_limit_window")]
    global_rate_limit_window: f64,
    #[serde(default)]
    status_entities: Vec<String>,
    #[serde(default = "defaults::menu_domains")]
    menu_domains_allowlist: Vec<String>,
    #[serde(default = "defaults::api_base_url")]
    api_base_url: String,
    #[serde(default = "defaults::websocket_url")]
    websocket_url: String,
}

mod defaults {
    pub fn cooldown_seconds() -> f64 {
        2.0
    }
    pub fn rate_limit_actions() -> u32 {
        10
    }
    pub fn rate_limit_window() -> f64 {
        5.0
    }
    pub fn menu_domains() -> Vec<String> {
        [
            "light",
            "switch",
            "vacuum",
            "climate",
            "media_player",
            "cover",
            "fan",
            "lock",
            "scene",
            "script",
            "button",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub fn api_base_url() -> String {
        "http://supervisor/core/api".to_string()
    }
    pub fn websocket_url() -> String {
        "ws://supervisor/core/websocket".to_string()
    }
}

/// Validated, immutable bridge configuration.
///
/// The access token is deliberately not part of this struct so that it can
/// never end up in a debug dump or a log line.
#[derive(Debug, Clone)]
pub struct Config {
    /// The only chat the bridge will talk to (0 = reject everything)
    pub allowed_chat_id: i64,
    /// Users allowed to trigger actions
    pub allowed_user_ids: Vec<UserId>,
    /// Default per-user per-action cooldown
    pub default_cooldown_seconds: f64,
    /// Per-action cooldown overrides, validated at load
    pub cooldown_overrides: HashMap<ActionKey, f64>,
    /// Global sliding-window cap on successful actions
    pub global_rate_limit_actions: u32,
    /// Global window length, seconds
    pub global_rate_limit_window: f64,
    /// Entities shown in the status view
    pub status_entities: Vec<EntityId>,
    /// Domains surfaced to users
    pub menu_domains_allowlist: Vec<String>,
    /// Base URL of the platform REST API
    pub api_base_url: String,
    /// URL of the platform streaming endpoint
    pub websocket_url: String,
}

impl Config {
    /// Load and validate the options file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let raw: RawOptions =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseJson {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawOptions) -> ConfigResult<Self> {
        if raw.cooldown_seconds < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "cooldown_seconds".into(),
                reason: "must be non-negative".into(),
            });
        }
        if raw.global_rate_limit_actions < 1 {
            return Err(ConfigError::InvalidValue {
                key: "global_rate_limit_actions".into(),
                reason: "must be >= 1".into(),
            });
        }
        if raw.global_rate_limit_window <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "global_rate_limit_window".into(),
                reason: "must be positive".into(),
            });
        }

        let mut cooldown_overrides = HashMap::new();
        for (key, value) in raw.cooldown_overrides {
            if value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("cooldown_overrides.{key}"),
                    reason: "must be non-negative".into(),
                });
            }
            cooldown_overrides.insert(ActionKey::new(key), value);
        }

        let mut status_entities = Vec::with_capacity(raw.status_entities.len());
        for raw_id in raw.status_entities {
            let entity_id: EntityId =
                raw_id.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "status_entities".into(),
                    reason: format!("'{raw_id}': {e}"),
                })?;
            status_entities.push(entity_id);
        }

        if raw.allowed_chat_id == 0 {
            warn!("allowed_chat_id is 0 - every chat will be rejected until configured");
        }
        if raw.allowed_user_ids.is_empty() {
            warn!("allowed_user_ids is empty - all actions will be denied");
        }

        Ok(Self {
            allowed_chat_id: raw.allowed_chat_id,
            allowed_user_ids: raw.allowed_user_ids.into_iter().map(UserId).collect(),
            default_cooldown_seconds: raw.cooldown_seconds,
            cooldown_overrides,
            global_rate_limit_actions: raw.global_rate_limit_actions,
            global_rate_limit_window: raw.global_rate_limit_window,
            status_entities,
            menu_domains_allowlist: raw.menu_domains_allowlist,
            api_base_url: raw.api_base_url,
            websocket_url: raw.websocket_url,
        })
    }

    /// Read the access token from the environment.
    pub fn load_token() -> ConfigResult<String> {
        std::env::var(TOKEN_ENV_VAR).map_err(|_| ConfigError::TokenMissing(TOKEN_ENV_VAR))
    }

    /// Effective cooldown for an action key: override if present, else the
    /// configured default.
    pub fn cooldown_for(&self, key: &ActionKey) -> f64 {
        self.cooldown_overrides
            .get(key)
            .copied()
            .unwrap_or(self.default_cooldown_seconds)
    }

    /// Whether a user may trigger actions at all.
    pub fn is_authorized_user(&self, user: UserId) -> bool {
        self.allowed_user_ids.contains(&user)
    }

    /// Whether a chat may talk to the bridge at all.
    pub fn is_authorized_chat(&self, chat_id: i64) -> bool {
        chat_id == self.allowed_chat_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_options(json: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_options() {
        let f = write_options(r#"{"allowed_chat_id": -100123, "allowed_user_ids": [7]}"#);
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.allowed_chat_id, -100123);
        assert_eq!(cfg.default_cooldown_seconds, 2.0);
        assert_eq!(cfg.global_rate_limit_actions, 10);
        assert!(cfg.is_authorized_user(UserId(7)));
        assert!(!cfg.is_authorized_user(UserId(8)));
    }

    #[test]
    fn test_cooldown_override_lookup() {
        let f = write_options(
            r#"{
                "allowed_chat_id": 1,
                "cooldown_seconds": 2.0,
                "cooldown_overrides": {"light.brightness": 0.2}
            }"#,
        );
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.cooldown_for(&ActionKey::new("light.brightness")), 0.2);
        assert_eq!(cfg.cooldown_for(&ActionKey::new("light.turn_on")), 2.0);
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let f = write_options(r#"{"allowed_chat_id": 1, "cooldown_seconds": -1.0}"#);
        assert!(matches!(
            Config::load(f.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_bad_status_entity_rejected() {
        let f = write_options(
            r#"{"allowed_chat_id": 1, "status_entities": ["not-an-entity-id"]}"#,
        );
        assert!(matches!(
            Config::load(f.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let f = write_options(r#"{"allowed_chat_id": 1, "global_rate_limit_actions": 0}"#);
        assert!(Config::load(f.path()).is_err());
    }
}
