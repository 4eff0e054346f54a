//! User action vocabulary: who asked for what, under which callback id

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Identifier of an acting chat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The unique identifier the messaging client attaches to one button press.
/// Two presses of the same button produce two distinct callback ids; a
/// redelivered press reuses the same one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub String);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cooldown bucket for an action, e.g. "light.turn_on" or
/// "vacuum.start". Overrides in config are keyed by this string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKey(pub String);

impl ActionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A control gesture that is debounced: rapid repeated taps collapse into
/// one outbound call carrying the final value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    /// Light brightness stepping; coalesced into an absolute level 1..=255.
    Brightness,
    /// Media volume stepping; coalesced into an absolute level 0.0..=1.0.
    Volume,
}

impl Gesture {
    /// Cooldown bucket shared by all taps of this gesture.
    pub fn action_key(&self) -> ActionKey {
        match self {
            Gesture::Brightness => ActionKey::new("light.brightness"),
            Gesture::Volume => ActionKey::new("media_player.volume"),
        }
    }
}

/// What the user asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    /// Direct service invocation ("turn_on", "return_to_base", ...).
    Service {
        domain: String,
        service: String,
        entity_id: EntityId,
    },
    /// A debounceable step gesture with the absolute target the tap
    /// resolves to (computed against current state at tap time).
    Step {
        gesture: Gesture,
        entity_id: EntityId,
        target: f64,
    },
}

impl ActionRequest {
    /// The rate-limit bucket this request falls into.
    pub fn action_key(&self) -> ActionKey {
        match self {
            ActionRequest::Service {
                domain, service, ..
            } => ActionKey::new(format!("{domain}.{service}")),
            ActionRequest::Step { gesture, .. } => gesture.action_key(),
        }
    }

    /// The entity the request targets.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            ActionRequest::Service { entity_id, .. } => entity_id,
            ActionRequest::Step { entity_id, .. } => entity_id,
        }
    }

    /// Step gestures are exempt from the duplicate-callback guard; their
    /// own coalescing window handles rapid repeats.
    pub fn is_debounceable(&self) -> bool {
        matches!(self, ActionRequest::Step { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_keys() {
        let req = ActionRequest::Service {
            domain: "light".into(),
            service: "turn_on".into(),
            entity_id: "light.desk".parse().unwrap(),
        };
        assert_eq!(req.action_key().as_str(), "light.turn_on");
        assert!(!req.is_debounceable());

        let step = ActionRequest::Step {
            gesture: Gesture::Brightness,
            entity_id: "light.desk".parse().unwrap(),
            target: 179.0,
        };
        assert_eq!(step.action_key().as_str(), "light.brightness");
        assert!(step.is_debounceable());
    }
}
