//! Callback routing: authorization, dedup, coalescing, execution
//!
//! One button press arrives as a callback id plus the action it maps to.
//! The route is: authorization guard, duplicate-callback guard, then
//! either the debounce path (step gestures coalesce into one call) or
//! the direct path (user lock, rate limiter, execute, audit).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use habot_api::{entity_payload_with, ActionExecutor, ApiError};
use habot_config::Config;
use habot_core::{ActionKey, ActionRequest, CallbackId, EntityId, Gesture, UserId};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rate_limit::{RateLimitDecision, RateLimiter};

/// Duplicate-callback suppression window
const IDEMPOTENCY_WINDOW: Duration = Duration::from_millis(250);
/// Step gestures settle after this much tap silence
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Execution(#[from] ApiError),
}

/// What happened to one callback. Everything here is a normal outcome;
/// only execution failures become errors.
#[derive(Debug)]
pub enum RouteOutcome {
    Executed,
    /// Step tap absorbed into the pending coalesce entry
    Coalesced,
    /// Same callback id redelivered within the idempotency window
    Duplicate,
    Unauthorized,
    RateLimited {
        retry_after: Duration,
        global: bool,
    },
}

/// Where action outcomes are recorded. The default writes structured
/// tracing events; a durable audit store can be swapped in.
pub trait AuditSink: Send + Sync {
    fn record(&self, user: UserId, action: &ActionKey, entity: &EntityId, error: Option<&str>);
}

pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, user: UserId, action: &ActionKey, entity: &EntityId, error: Option<&str>) {
        match error {
            None => info!(user = %user, action = %action, entity = %entity, ok = true, "action audit"),
            Some(detail) => {
                warn!(user = %user, action = %action, entity = %entity, ok = false, detail, "action audit")
            }
        }
    }
}

type CoalesceKey = (UserId, EntityId, Gesture);

struct PendingCoalesce {
    target: f64,
    /// Bumped on every tap; a timer only flushes its own generation
    generation: u64,
}

pub struct CallbackRouter {
    executor: Arc<dyn ActionExecutor>,
    limiter: Arc<RateLimiter>,
    config: Arc<Config>,
    audit: Arc<dyn AuditSink>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
    recent_callbacks: DashMap<CallbackId, tokio::time::Instant>,
    pending: DashMap<CoalesceKey, PendingCoalesce>,
}

impl CallbackRouter {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        limiter: Arc<RateLimiter>,
        config: Arc<Config>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            limiter,
            config,
            audit,
            user_locks: DashMap::new(),
            recent_callbacks: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Route one button press.
    pub async fn handle_callback(
        self: &Arc<Self>,
        chat_id: i64,
        user: UserId,
        callback: CallbackId,
        request: ActionRequest,
    ) -> Result<RouteOutcome, RouterError> {
        if !self.config.is_authorized_chat(chat_id) || !self.config.is_authorized_user(user) {
            warn!(chat_id, user = %user, "unauthorized callback rejected");
            return Ok(RouteOutcome::Unauthorized);
        }

        // Step gestures have their own coalescing window; a redelivered
        // tap just merges like any other tap, so they skip this guard.
        if !request.is_debounceable() {
            let now = tokio::time::Instant::now();
            if let Some(seen) = self.recent_callbacks.get(&callback) {
                if now.duration_since(*seen) < IDEMPOTENCY_WINDOW {
                    debug!(callback = %callback, "duplicate callback dropped");
                    return Ok(RouteOutcome::Duplicate);
                }
            }
            self.recent_callbacks.insert(callback, now);
        }

        match request {
            ActionRequest::Step {
                gesture,
                entity_id,
                target,
            } => self.coalesce_tap(user, entity_id, gesture, target),
            ActionRequest::Service {
                domain,
                service,
                entity_id,
            } => self.execute_service(user, &domain, &service, &entity_id).await,
        }
    }

    /// Merge a tap into the pending entry and restart its settle timer.
    fn coalesce_tap(
        self: &Arc<Self>,
        user: UserId,
        entity_id: EntityId,
        gesture: Gesture,
        target: f64,
    ) -> Result<RouteOutcome, RouterError> {
        // Rejections happen at tap time so the user hears about them;
        // nothing is recorded until the flush succeeds.
        match self.limiter.check(user, &gesture.action_key()) {
            RateLimitDecision::Allowed(_permit) => {}
            RateLimitDecision::Cooldown { retry_after } => {
                return Ok(RouteOutcome::RateLimited {
                    retry_after,
                    global: false,
                })
            }
            RateLimitDecision::GlobalLimit { retry_after } => {
                return Ok(RouteOutcome::RateLimited {
                    retry_after,
                    global: true,
                })
            }
        }

        let key = (user, entity_id, gesture);
        let generation = {
            let mut entry = self.pending.entry(key.clone()).or_insert(PendingCoalesce {
                target,
                generation: 0,
            });
            entry.target = target;
            entry.generation += 1;
            entry.generation
        };

        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            router.flush_if_settled(&key, generation).await;
        });

        Ok(RouteOutcome::Coalesced)
    }

    /// Flush one coalesce entry if no newer tap superseded this timer.
    async fn flush_if_settled(&self, key: &CoalesceKey, generation: u64) {
        let Some((_, pending)) = self
            .pending
            .remove_if(key, |_, p| p.generation == generation)
        else {
            return;
        };
        self.flush_entry(key, pending.target).await;
    }

    /// Issue the single coalesced call for one settled gesture.
    async fn flush_entry(&self, key: &CoalesceKey, target: f64) {
        let (user, entity_id, gesture) = key;
        let action_key = gesture.action_key();

        let lock = self.user_lock(*user);
        let _guard = lock.lock().await;

        let result = match gesture {
            Gesture::Brightness => {
                let level = target.round().clamp(1.0, 255.0) as i64;
                self.executor
                    .call_service(
                        "light",
                        "turn_on",
                        entity_payload_with(
                            entity_id,
                            [("brightness", json!(level))].into_iter().collect(),
                        ),
                    )
                    .await
            }
            Gesture::Volume => {
                let level = target.clamp(0.0, 1.0);
                self.executor
                    .call_service(
                        "media_player",
                        "volume_set",
                        entity_payload_with(
                            entity_id,
                            [("volume_level", json!(level))].into_iter().collect(),
                        ),
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.limiter.record_success(*user, &action_key).await;
                self.audit.record(*user, &action_key, entity_id, None);
            }
            Err(e) => {
                self.audit
                    .record(*user, &action_key, entity_id, Some(&e.to_string()));
            }
        }
    }

    /// Direct path: user lock, rate limiter, execute, audit.
    async fn execute_service(
        &self,
        user: UserId,
        domain: &str,
        service: &str,
        entity_id: &EntityId,
    ) -> Result<RouteOutcome, RouterError> {
        let action_key = ActionKey::new(format!("{domain}.{service}"));
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let permit = match self.limiter.check(user, &action_key) {
            RateLimitDecision::Allowed(permit) => permit,
            RateLimitDecision::Cooldown { retry_after } => {
                return Ok(RouteOutcome::RateLimited {
                    retry_after,
                    global: false,
                })
            }
            RateLimitDecision::GlobalLimit { retry_after } => {
                return Ok(RouteOutcome::RateLimited {
                    retry_after,
                    global: true,
                })
            }
        };

        let payload = entity_payload_with(entity_id, Default::default());
        match self.executor.call_service(domain, service, payload).await {
            Ok(()) => {
                permit.record().await;
                self.audit.record(user, &action_key, entity_id, None);
                Ok(RouteOutcome::Executed)
            }
            Err(e) => {
                self.audit
                    .record(user, &action_key, entity_id, Some(&e.to_string()));
                Err(RouterError::Execution(e))
            }
        }
    }

    /// Flush every pending coalesce entry immediately. Called on
    /// shutdown so settled taps are issued, not dropped.
    pub async fn flush_pending(&self) {
        let keys: Vec<CoalesceKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                info!(user = %key.0, entity = %key.1, "flushing pending gesture on shutdown");
                self.flush_entry(&key, pending.target).await;
            }
        }
    }

    /// Drop idempotency entries older than the window.
    pub fn gc_callbacks(&self) {
        let now = tokio::time::Instant::now();
        self.recent_callbacks
            .retain(|_, seen| now.duration_since(*seen) < IDEMPOTENCY_WINDOW);
    }

    fn user_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use habot_storage::Storage;
    use serde_json::Value;
    use tempfile::TempDir;

    struct CountingExecutor {
        calls: StdMutex<Vec<(String, String, Value)>>,
    }

    impl CountingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ActionExecutor for CountingExecutor {
        async fn call_service(
            &self,
            domain: &str,
            service: &str,
            data: Value,
        ) -> Result<(), ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((domain.to_string(), service.to_string(), data));
            Ok(())
        }
    }

    fn config(default_cooldown: f64) -> Arc<Config> {
        Arc::new(Config {
            allowed_chat_id: 1,
            allowed_user_ids: vec![UserId(7), UserId(8)],
            default_cooldown_seconds: default_cooldown,
            cooldown_overrides: HashMap::new(),
            global_rate_limit_actions: 100,
            global_rate_limit_window: 5.0,
            status_entities: vec![],
            menu_domains_allowlist: vec![],
            api_base_url: "http://supervisor/core/api".to_string(),
            websocket_url: "ws://supervisor/core/websocket".to_string(),
        })
    }

    async fn router(
        dir: &TempDir,
        config: Arc<Config>,
    ) -> (Arc<CallbackRouter>, Arc<CountingExecutor>) {
        let storage = Arc::new(Storage::new(dir.path()));
        let limiter = Arc::new(RateLimiter::load(storage, config.clone()).await.unwrap());
        let executor = CountingExecutor::new();
        let router = CallbackRouter::new(executor.clone(), limiter, config, Arc::new(TracingAudit));
        (router, executor)
    }

    fn turn_on(object_id: &str) -> ActionRequest {
        ActionRequest::Service {
            domain: "light".to_string(),
            service: "turn_on".to_string(),
            entity_id: format!("light.{object_id}").parse().unwrap(),
        }
    }

    fn brightness_tap(target: f64) -> ActionRequest {
        ActionRequest::Step {
            gesture: Gesture::Brightness,
            entity_id: "light.desk".parse().unwrap(),
            target,
        }
    }

    #[tokio::test]
    async fn test_unauthorized_user_rejected_before_anything_else() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        let outcome = router
            .handle_callback(1, UserId(99), CallbackId("cb1".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Unauthorized));

        let outcome = router
            .handle_callback(42, UserId(7), CallbackId("cb2".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Unauthorized));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_callback_id_dropped_distinct_ids_pass() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        let out = router
            .handle_callback(1, UserId(7), CallbackId("cb1".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(out, RouteOutcome::Executed));

        // redelivery of the same press within the window
        let out = router
            .handle_callback(1, UserId(7), CallbackId("cb1".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(out, RouteOutcome::Duplicate));

        // a distinct press 0.1s later is a real second action
        tokio::time::advance(Duration::from_millis(100)).await;
        let out = router
            .handle_callback(1, UserId(7), CallbackId("cb2".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(out, RouteOutcome::Executed));

        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_taps_coalesce_into_one_call_with_final_value() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        for (i, target) in [80.0, 120.0, 179.0].iter().enumerate() {
            let out = router
                .handle_callback(
                    1,
                    UserId(7),
                    CallbackId(format!("tap{i}")),
                    brightness_tap(*target),
                )
                .await
                .unwrap();
            assert!(matches!(out, RouteOutcome::Coalesced));
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        // let the settle timer fire
        tokio::time::sleep(Duration::from_millis(300)).await;

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        let (domain, service, data) = &calls[0];
        assert_eq!(domain, "light");
        assert_eq!(service, "turn_on");
        assert_eq!(data["brightness"], 179);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_taps_are_separate_calls() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        router
            .handle_callback(1, UserId(7), CallbackId("t1".into()), brightness_tap(100.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        router
            .handle_callback(1, UserId(7), CallbackId("t2".into()), brightness_tap(200.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2["brightness"], 100);
        assert_eq!(calls[1].2["brightness"], 200);
    }

    #[tokio::test]
    async fn test_cooldown_surfaces_as_rate_limited() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(60.0)).await;

        let out = router
            .handle_callback(1, UserId(7), CallbackId("a".into()), turn_on("desk"))
            .await
            .unwrap();
        assert!(matches!(out, RouteOutcome::Executed));

        let out = router
            .handle_callback(1, UserId(7), CallbackId("b".into()), turn_on("desk"))
            .await
            .unwrap();
        match out {
            RouteOutcome::RateLimited {
                retry_after,
                global,
            } => {
                assert!(!global);
                assert!(retry_after > Duration::from_secs(55));
            }
            other => panic!("expected rate limit: {other:?}"),
        }
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flush_issues_pending_gesture_once() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        router
            .handle_callback(1, UserId(7), CallbackId("t".into()), brightness_tap(140.0))
            .await
            .unwrap();

        // flush before the timer fires
        router.flush_pending().await;
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(executor.calls()[0].2["brightness"], 140);

        // the orphaned timer finds nothing to flush
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_flush_uses_absolute_level() {
        let dir = TempDir::new().unwrap();
        let (router, executor) = router(&dir, config(0.0)).await;

        let tap = ActionRequest::Step {
            gesture: Gesture::Volume,
            entity_id: "media_player.living_room".parse().unwrap(),
            target: 0.45,
        };
        router
            .handle_callback(1, UserId(7), CallbackId("v".into()), tap)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "media_player");
        assert_eq!(calls[0].1, "volume_set");
        assert_eq!(calls[0].2["volume_level"], 0.45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_expired_idempotency_entries() {
        let dir = TempDir::new().unwrap();
        let (router, _executor) = router(&dir, config(0.0)).await;

        router
            .handle_callback(1, UserId(7), CallbackId("old".into()), turn_on("desk"))
            .await
            .unwrap();
        assert_eq!(router.recent_callbacks.len(), 1);

        tokio::time::advance(Duration::from_millis(300)).await;
        router.gc_callbacks();
        assert!(router.recent_callbacks.is_empty());
    }
}
