//! Notification dispatcher
//!
//! Watches state changes on behalf of subscribers and delivers alerts
//! through the messenger. Per entity, the decision sequence runs under a
//! lock so the throttle check-and-update is atomic; different entities
//! proceed concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use habot_core::{key_attributes, EntityId, EntityState, UserId};
use habot_storage::{
    Storage, StorageError, SubscriptionData, SubscriptionMode, SubscriptionRecord,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alert::Alert;

/// Minimum spacing between two alerts for the same subscription
const THROTTLE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Delivery failure reported by the messenger
#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outbound delivery seam. The chat client implements this; tests record.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send_alert(&self, user: UserId, alert: &Alert) -> Result<(), DeliveryError>;
}

type SubKey = (UserId, EntityId);

pub struct NotificationDispatcher {
    messenger: Arc<dyn Messenger>,
    storage: Arc<Storage>,
    subscriptions: DashMap<SubKey, SubscriptionRecord>,
    entity_locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl NotificationDispatcher {
    /// Load persisted subscriptions and wire up the messenger.
    pub async fn load(
        storage: Arc<Storage>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self, NotifyError> {
        let data = storage
            .load::<SubscriptionData>()
            .await?
            .unwrap_or_default();
        let subscriptions = DashMap::new();
        for record in data.subscriptions {
            subscriptions.insert((record.user_id, record.entity_id.clone()), record);
        }
        info!(count = subscriptions.len(), "subscriptions loaded");
        Ok(Self {
            messenger,
            storage,
            subscriptions,
            entity_locks: DashMap::new(),
        })
    }

    /// Subscribe a user to an entity. Returns false when an identical
    /// subscription already existed.
    pub async fn subscribe(
        &self,
        user: UserId,
        entity: EntityId,
        mode: SubscriptionMode,
    ) -> Result<bool, NotifyError> {
        let changed = {
            match self.subscriptions.entry((user, entity.clone())) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    if occupied.get().mode == mode {
                        false
                    } else {
                        occupied.get_mut().mode = mode;
                        true
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(SubscriptionRecord {
                        user_id: user,
                        entity_id: entity,
                        mode,
                        last_notified_at: None,
                        muted_until: None,
                    });
                    true
                }
            }
        };
        if changed {
            self.persist().await?;
        }
        Ok(changed)
    }

    pub async fn unsubscribe(&self, user: UserId, entity: &EntityId) -> Result<bool, NotifyError> {
        let removed = self
            .subscriptions
            .remove(&(user, entity.clone()))
            .is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Silence one subscription for the given duration.
    pub async fn mute(
        &self,
        user: UserId,
        entity: &EntityId,
        duration: Duration,
    ) -> Result<bool, NotifyError> {
        let muted = {
            match self.subscriptions.get_mut(&(user, entity.clone())) {
                Some(mut record) => {
                    record.muted_until =
                        Some(Utc::now() + chrono::Duration::seconds(duration.as_secs() as i64));
                    true
                }
                None => false,
            }
        };
        if muted {
            self.persist().await?;
        }
        Ok(muted)
    }

    pub fn subscriptions_for(&self, user: UserId) -> Vec<SubscriptionRecord> {
        let mut out: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().0 == user)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|r| r.entity_id.to_string());
        out
    }

    /// Drop subscriptions for entities a registry sync no longer knows.
    pub async fn prune_removed(&self, removed: &[EntityId]) -> Result<usize, NotifyError> {
        if removed.is_empty() {
            return Ok(0);
        }
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|(_, entity), _| !removed.contains(entity));
        let pruned = before - self.subscriptions.len();
        if pruned > 0 {
            info!(pruned, "subscriptions pruned for removed entities");
            self.persist().await?;
        }
        Ok(pruned)
    }

    /// Process one state change for all subscribers of its entity.
    ///
    /// Per subscription: mute, change relevance, throttle, then deliver.
    /// Delivery failures are logged and swallowed; the throttle stamp is
    /// advanced either way so a flapping messenger cannot cause a burst.
    pub async fn handle_change(
        &self,
        old: Option<&EntityState>,
        new: &EntityState,
        display_name: &str,
    ) {
        let entity = new.entity_id.clone();
        let lock = self
            .entity_locks
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let now = Utc::now();
        let state_changed = old.map(|o| o.state != new.state).unwrap_or(false);
        let changed_attrs = changed_key_attributes(old, new);

        let mut deliveries: Vec<(UserId, SubscriptionMode)> = Vec::new();
        for entry in self.subscriptions.iter() {
            let (user, sub_entity) = entry.key();
            if *sub_entity != entity {
                continue;
            }
            let record = entry.value();

            if is_muted(record.muted_until, now) {
                continue;
            }
            let relevant = match record.mode {
                SubscriptionMode::StateOnly => state_changed,
                SubscriptionMode::StateAndKeyAttrs => state_changed || !changed_attrs.is_empty(),
            };
            if !relevant {
                continue;
            }
            if let Some(last) = record.last_notified_at {
                if (now - last).num_seconds() < THROTTLE_SECS {
                    debug!(entity = %entity, user = %user, "alert throttled");
                    continue;
                }
            }
            deliveries.push((*user, record.mode));
        }

        if deliveries.is_empty() {
            return;
        }

        for (user, mode) in deliveries {
            let attrs = match mode {
                SubscriptionMode::StateOnly => Vec::new(),
                SubscriptionMode::StateAndKeyAttrs => changed_attrs.clone(),
            };
            let alert = Alert::for_change(display_name, new, attrs);
            if let Err(e) = self.messenger.send_alert(user, &alert).await {
                warn!(entity = %entity, user = %user, error = %e, "alert delivery failed");
            }
            if let Some(mut record) = self.subscriptions.get_mut(&(user, entity.clone())) {
                record.last_notified_at = Some(now);
            }
        }

        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist notification timestamps");
        }
    }

    async fn persist(&self) -> Result<(), NotifyError> {
        let data = SubscriptionData {
            subscriptions: {
                let mut subs: Vec<_> = self
                    .subscriptions
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                subs.sort_by_key(|r| (r.user_id.0, r.entity_id.to_string()));
                subs
            },
        };
        self.storage.save(&data).await?;
        Ok(())
    }
}

fn is_muted(muted_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    muted_until.is_some_and(|until| until > now)
}

/// Key attributes that differ between two reports, with their new values.
fn changed_key_attributes(
    old: Option<&EntityState>,
    new: &EntityState,
) -> Vec<(String, String)> {
    let Some(old) = old else {
        return Vec::new();
    };
    let mut changed = Vec::new();
    for key in key_attributes(new.entity_id.domain()) {
        let old_value = old.attributes.get(*key);
        let new_value = new.attributes.get(*key);
        if old_value != new_value {
            if let Some(value) = new_value {
                let rendered = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                changed.push((key.to_string(), rendered));
            }
        }
    }
    changed
}
