//! Supervisor add-on entry point
//!
//! Wires the components together and runs the event loop: stream events
//! into the registry and notifier, a periodic full resync, idempotency
//! GC, and a graceful shutdown that flushes settled gestures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use habot_api::ApiClient;
use habot_config::Config;
use habot_core::UserId;
use habot_dispatch::{CallbackRouter, RateLimiter, TracingAudit};
use habot_notify::{Alert, DeliveryError, Messenger, NotificationDispatcher};
use habot_registry::{RegistryEngine, RESYNC_INTERVAL};
use habot_storage::Storage;
use habot_stream::{StreamEvent, StreamHandle, StreamManager};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";
const SELF_TEST_ATTEMPTS: u32 = 5;
const READINESS_BACKOFF: Duration = Duration::from_secs(3);
const CALLBACK_GC_INTERVAL: Duration = Duration::from_secs(1);

/// Stand-in delivery sink until a chat transport is attached. Alerts are
/// fully formed at this point; this just writes them to the log.
struct LoggingMessenger;

#[async_trait::async_trait]
impl Messenger for LoggingMessenger {
    async fn send_alert(&self, user: UserId, alert: &Alert) -> Result<(), DeliveryError> {
        info!(
            user = %user,
            entity = %alert.entity_id,
            state = %alert.state_line,
            actions = alert.actions.len(),
            "alert"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let options_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OPTIONS_PATH));

    let token = Config::load_token()?;
    let config = Arc::new(Config::load(&options_path)?);
    info!(options = %options_path.display(), "configuration loaded");

    let data_dir = options_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("/data"));
    let storage = Arc::new(Storage::new(data_dir));

    let api = Arc::new(ApiClient::new(config.api_base_url.clone(), token.clone())?);
    self_test(&api).await;

    let (stream, mut events, stream_task) =
        StreamManager::spawn(config.websocket_url.clone(), token);

    let registry = Arc::new(RegistryEngine::new());
    let notify = Arc::new(
        NotificationDispatcher::load(storage.clone(), Arc::new(LoggingMessenger))
            .await
            .context("loading subscriptions")?,
    );
    let limiter = Arc::new(
        RateLimiter::load(storage.clone(), config.clone())
            .await
            .context("loading rate limiter state")?,
    );
    let router = CallbackRouter::new(api, limiter, config, Arc::new(TracingAudit));

    // Readiness: the first full sync must land before we serve anything.
    loop {
        match full_sync(&stream, &registry, &notify).await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, "initial sync not ready, retrying");
                tokio::time::sleep(READINESS_BACKOFF).await;
            }
        }
    }
    info!(
        entities = registry.snapshot().entity_count(),
        "initial sync complete, serving"
    );

    let mut resync = tokio::time::interval(RESYNC_INTERVAL);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    resync.reset(); // the initial sync just happened
    let mut gc = tokio::time::interval(CALLBACK_GC_INTERVAL);
    gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                None => {
                    error!("stream task stopped unexpectedly");
                    break;
                }
                Some(event) => handle_stream_event(event, &stream, &registry, &notify).await,
            },
            _ = resync.tick() => {
                if let Err(e) = full_sync(&stream, &registry, &notify).await {
                    warn!(error = %e, "periodic resync failed");
                }
            }
            _ = gc.tick() => router.gc_callbacks(),
        }
    }

    router.flush_pending().await;
    drop(stream);
    drop(events);
    let _ = stream_task.await;
    info!("shutdown complete");
    Ok(())
}

/// Verify the REST API answers and log the platform version.
async fn self_test(api: &ApiClient) {
    for attempt in 1..=SELF_TEST_ATTEMPTS {
        match api.get_config().await {
            Ok(config) => {
                let version = config
                    .get("version")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                info!(version, "platform API reachable");
                return;
            }
            Err(e) => warn!(attempt, error = %e, "platform API self-test failed"),
        }
        tokio::time::sleep(READINESS_BACKOFF).await;
    }
    warn!("platform API unreachable, continuing anyway");
}

async fn handle_stream_event(
    event: StreamEvent,
    stream: &StreamHandle,
    registry: &Arc<RegistryEngine>,
    notify: &Arc<NotificationDispatcher>,
) {
    match event {
        StreamEvent::Online { resumed } => {
            if resumed {
                info!("stream reconnected, resyncing");
                if let Err(e) = full_sync(stream, registry, notify).await {
                    warn!(error = %e, "post-reconnect resync failed");
                }
            }
        }
        StreamEvent::Offline => warn!("stream offline, reconnecting"),
        StreamEvent::Degraded => error!("stream degraded, probing in the background"),
        StreamEvent::RegistryChanged(kind) => {
            debug!(?kind, "registry changed upstream, resyncing");
            if let Err(e) = full_sync(stream, registry, notify).await {
                warn!(error = %e, "registry-triggered resync failed");
            }
        }
        StreamEvent::StateChanged(data) => {
            let old = registry.state(&data.entity_id);
            registry.apply_state_event(&data);

            let Some(new_state) = data.new_state else {
                return;
            };
            if !registry.snapshot().contains_entity(&data.entity_id) {
                return;
            }
            let name = registry.display_name(&data.entity_id);
            let notify = Arc::clone(notify);
            // per-entity sequencing happens inside the dispatcher
            tokio::spawn(async move {
                notify.handle_change(old.as_ref(), &new_state, &name).await;
            });
        }
    }
}

/// Fetch registries and states, install the snapshot, prune orphaned
/// subscriptions.
async fn full_sync(
    stream: &StreamHandle,
    registry: &Arc<RegistryEngine>,
    notify: &Arc<NotificationDispatcher>,
) -> Result<()> {
    let dump = stream.fetch_registries().await?;
    let states = stream.fetch_states().await?;
    let diff = registry.install(&dump, states).context("installing sync")?;
    if !diff.removed_entities.is_empty() {
        notify
            .prune_removed(&diff.removed_entities)
            .await
            .context("pruning subscriptions")?;
    }
    Ok(())
}
