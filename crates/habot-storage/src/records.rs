//! Durable record shapes: subscriptions and rate-limiter cooldowns

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use habot_core::{EntityId, UserId};
use serde::{Deserialize, Serialize};

use crate::store::Storable;

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Only changes of the state value itself
    StateOnly,
    /// State value changes plus changes of the domain's key attributes
    StateAndKeyAttrs,
}

/// One (user, entity) notification subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub mode: SubscriptionMode,
    /// When the user was last notified about this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
    /// Notifications are suppressed until this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
}

/// All subscriptions, as stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscriptions: Vec<SubscriptionRecord>,
}

impl Storable for SubscriptionData {
    const KEY: &'static str = "habot.subscriptions";
    const VERSION: u32 = 1;
}

/// Per-(user, action) cooldown timestamps, as stored.
///
/// Keys are serialized as `"<user_id>:<action_key>"` so the map survives
/// JSON's string-key restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateStateData {
    pub last_action: HashMap<String, DateTime<Utc>>,
}

impl RateStateData {
    pub fn encode_key(user: UserId, action: &str) -> String {
        format!("{}:{action}", user.0)
    }
}

impl Storable for RateStateData {
    const KEY: &'static str = "habot.rate_state";
    const VERSION: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_subscription_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let data = SubscriptionData {
            subscriptions: vec![SubscriptionRecord {
                user_id: UserId(7),
                entity_id: "vacuum.robo".parse().unwrap(),
                mode: SubscriptionMode::StateAndKeyAttrs,
                last_notified_at: None,
                muted_until: None,
            }],
        };
        storage.save(&data).await.unwrap();

        let loaded: SubscriptionData = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.subscriptions.len(), 1);
        assert_eq!(loaded.subscriptions[0].user_id, UserId(7));
        assert_eq!(
            loaded.subscriptions[0].mode,
            SubscriptionMode::StateAndKeyAttrs
        );
    }

    #[test]
    fn test_rate_state_key_encoding() {
        assert_eq!(
            RateStateData::encode_key(UserId(42), "light.turn_on"),
            "42:light.turn_on"
        );
    }
}
