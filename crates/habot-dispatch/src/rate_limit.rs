//! Two-stage rate limiting: per-action cooldowns plus a global window
//!
//! Check first, record later: passing both checks hands back a permit,
//! and only a recorded permit counts. A rejected or failed action leaves
//! no trace in either stage. Cooldown timestamps are wall-clock and
//! persisted so they survive restarts; the global sliding window is
//! in-memory by design.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use habot_config::Config;
use habot_core::{ActionKey, UserId};
use habot_storage::{RateStateData, Storage, StorageError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of a rate-limit check. Rejections are normal outcomes.
#[derive(Debug)]
pub enum RateLimitDecision<'a> {
    Allowed(Permit<'a>),
    Cooldown { retry_after: Duration },
    GlobalLimit { retry_after: Duration },
}

/// Proof that both checks passed. Record it after the action succeeds;
/// dropping it unrecorded costs nothing.
#[must_use]
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    user: UserId,
    key: ActionKey,
}

impl Permit<'_> {
    pub async fn record(self) {
        self.limiter.record_success(self.user, &self.key).await;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: Arc<Config>,
    storage: Arc<Storage>,
    /// Last successful action per (user, action key)
    cooldowns: DashMap<(UserId, ActionKey), DateTime<Utc>>,
    /// Completion times of recent successful actions, oldest first
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Restore persisted cooldown state and build the limiter.
    pub async fn load(storage: Arc<Storage>, config: Arc<Config>) -> Result<Self, RateLimitError> {
        let cooldowns = DashMap::new();
        if let Some(data) = storage.load::<RateStateData>().await? {
            for (encoded, stamp) in data.last_action {
                match decode_key(&encoded) {
                    Some((user, key)) => {
                        cooldowns.insert((user, key), stamp);
                    }
                    None => warn!(key = %encoded, "dropping unparseable cooldown entry"),
                }
            }
        }
        info!(cooldowns = cooldowns.len(), "rate limiter state loaded");
        Ok(Self {
            config,
            storage,
            cooldowns,
            window: Mutex::new(VecDeque::new()),
        })
    }

    /// Run both checks for one prospective action.
    pub fn check(&self, user: UserId, key: &ActionKey) -> RateLimitDecision<'_> {
        let cooldown = self.config.cooldown_for(key);
        if cooldown > 0.0 {
            if let Some(last) = self.cooldowns.get(&(user, key.clone())) {
                let elapsed = ((Utc::now() - *last).num_milliseconds() as f64 / 1000.0).max(0.0);
                if elapsed < cooldown {
                    let retry_after = Duration::from_secs_f64(cooldown - elapsed);
                    debug!(user = %user, action = %key, ?retry_after, "cooldown rejection");
                    return RateLimitDecision::Cooldown { retry_after };
                }
            }
        }

        let window_len = Duration::from_secs_f64(self.config.global_rate_limit_window);
        let max = self.config.global_rate_limit_actions as usize;
        let now = Instant::now();
        let mut window = lock(&self.window);
        while window.front().is_some_and(|t| *t + window_len <= now) {
            window.pop_front();
        }
        if window.len() >= max {
            // oldest entry leaving the window frees the next slot
            let retry_after = window
                .front()
                .map(|t| (*t + window_len).saturating_duration_since(now))
                .unwrap_or_default();
            debug!(user = %user, action = %key, ?retry_after, "global window rejection");
            return RateLimitDecision::GlobalLimit { retry_after };
        }
        drop(window);

        RateLimitDecision::Allowed(Permit {
            limiter: self,
            user,
            key: key.clone(),
        })
    }

    /// Count one successfully executed action in both stages.
    pub async fn record_success(&self, user: UserId, key: &ActionKey) {
        self.cooldowns
            .insert((user, key.clone()), Utc::now());
        lock(&self.window).push_back(Instant::now());
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist cooldown state");
        }
    }

    async fn persist(&self) -> Result<(), RateLimitError> {
        let mut data = RateStateData::default();
        for entry in self.cooldowns.iter() {
            let (user, key) = entry.key();
            data.last_action
                .insert(RateStateData::encode_key(*user, key.as_str()), *entry.value());
        }
        self.storage.save(&data).await?;
        Ok(())
    }
}

fn decode_key(encoded: &str) -> Option<(UserId, ActionKey)> {
    let (user, action) = encoded.split_once(':')?;
    let user: i64 = user.parse().ok()?;
    Some((UserId(user), ActionKey::new(action)))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
