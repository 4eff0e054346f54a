//! Persistent WebSocket connection with reconnect and command pairing
//!
//! A background task owns the socket. It authenticates, subscribes to the
//! event types the rest of the system consumes, and forwards frames as
//! [`StreamEvent`]s. Request/response commands (registry listings, state
//! dumps) are paired to their result frames by command id, so event frames
//! arriving in between do not disturb them.
//!
//! Reconnects back off from 3s, doubling to a 30s cap. After 10 failed
//! attempts in a row the connection is declared degraded and probed every
//! 30s until the platform answers again.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::wire::{
    ClientMessage, RegistryDump, RegistryKind, ServerMessage, StateChangedData,
    SUBSCRIBED_EVENT_TYPES,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_secs(3);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_CONNECT_ATTEMPTS: u32 = 10;
const DEGRADED_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Errors surfaced to command callers
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("a registry fetch is already in flight")]
    Busy,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("command failed: {code}: {message}")]
    Command { code: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream manager stopped")]
    Shutdown,
}

/// Observable lifecycle of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Authenticated,
    Degraded,
}

/// What the stream task emits to the rest of the system
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Authenticated and subscribed. `resumed` is false only for the
    /// first connection of the process.
    Online { resumed: bool },
    /// The socket dropped; a reconnect is underway.
    Offline,
    /// Reconnect attempts exhausted; probing continues in the background.
    Degraded,
    StateChanged(StateChangedData),
    RegistryChanged(RegistryKind),
}

enum Command {
    FetchRegistries(oneshot::Sender<Result<RegistryDump, StreamError>>),
    FetchStates(oneshot::Sender<Result<Vec<Value>, StreamError>>),
}

impl Command {
    fn reject(self, err: StreamError) {
        match self {
            Command::FetchRegistries(tx) => {
                let _ = tx.send(Err(err));
            }
            Command::FetchStates(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// In-flight registry listing batch, one per connection at most
struct PendingRegistries {
    ids: HashMap<u64, RegistryKind>,
    dump: RegistryDump,
    reply: Option<oneshot::Sender<Result<RegistryDump, StreamError>>>,
}

/// Cloneable handle for issuing commands and observing connection state
#[derive(Clone)]
pub struct StreamHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamHandle {
    /// Fetch all four registries in one batch.
    pub async fn fetch_registries(&self) -> Result<RegistryDump, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::FetchRegistries(tx))
            .await
            .map_err(|_| StreamError::Shutdown)?;
        rx.await.map_err(|_| StreamError::ConnectionLost)?
    }

    /// Fetch the current state of every entity.
    pub async fn fetch_states(&self) -> Result<Vec<Value>, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::FetchStates(tx))
            .await
            .map_err(|_| StreamError::Shutdown)?;
        rx.await.map_err(|_| StreamError::ConnectionLost)?
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

enum ServeExit {
    Disconnected,
    Shutdown,
}

/// The background task that owns the socket
pub struct StreamManager {
    url: String,
    token: String,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    state: watch::Sender<ConnectionState>,
}

impl StreamManager {
    /// Spawn the connection task. Dropping the returned handle (and its
    /// clones) shuts the task down after the current frame.
    pub fn spawn(
        url: impl Into<String>,
        token: impl Into<String>,
    ) -> (
        StreamHandle,
        mpsc::Receiver<StreamEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = StreamManager {
            url: url.into(),
            token: token.into(),
            commands: cmd_rx,
            events: event_tx,
            state: state_tx,
        };
        let task = tokio::spawn(manager.run());

        (
            StreamHandle {
                commands: cmd_tx,
                state: state_rx,
            },
            event_rx,
            task,
        )
    }

    async fn run(mut self) {
        let mut resumed = false;

        'outer: loop {
            let mut session = None;
            for attempt in 1..=MAX_CONNECT_ATTEMPTS {
                self.set_state(ConnectionState::Connecting { attempt });
                match self.establish().await {
                    Ok(s) => {
                        session = Some(s);
                        break;
                    }
                    Err(e) => warn!(attempt, error = %e, "connect failed"),
                }
                if attempt < MAX_CONNECT_ATTEMPTS {
                    match self.answer_commands_until(backoff_for(attempt)).await {
                        WaitOutcome::Elapsed => {}
                        WaitOutcome::Shutdown => break 'outer,
                    }
                }
            }

            let session = match session {
                Some(s) => s,
                None => {
                    error!(
                        attempts = MAX_CONNECT_ATTEMPTS,
                        "reconnect attempts exhausted, entering degraded mode"
                    );
                    self.set_state(ConnectionState::Degraded);
                    if self.events.send(StreamEvent::Degraded).await.is_err() {
                        break;
                    }
                    match self.probe_until_connected().await {
                        Some(s) => s,
                        None => break,
                    }
                }
            };

            self.set_state(ConnectionState::Authenticated);
            if self
                .events
                .send(StreamEvent::Online { resumed })
                .await
                .is_err()
            {
                break;
            }
            resumed = true;

            let exit = self.serve(session).await;
            self.set_state(ConnectionState::Disconnected);
            if matches!(exit, ServeExit::Shutdown) {
                break;
            }
            if self.events.send(StreamEvent::Offline).await.is_err() {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("stream manager stopped");
    }

    /// Open the socket, run the auth handshake, and subscribe.
    async fn establish(&self) -> Result<Session, StreamError> {
        let (stream, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| StreamError::Protocol("connect timeout".to_string()))?
            .map_err(|e| StreamError::Protocol(format!("connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        match recv_handshake_frame(&mut read).await? {
            ServerMessage::AuthRequired { .. } => {}
            other => {
                return Err(StreamError::Protocol(format!(
                    "expected auth_required, got {other:?}"
                )))
            }
        }

        send_frame(
            &mut write,
            &ClientMessage::Auth {
                access_token: self.token.clone(),
            },
        )
        .await?;

        match recv_handshake_frame(&mut read).await? {
            ServerMessage::AuthOk { ha_version } => {
                info!(
                    version = ha_version.as_deref().unwrap_or("unknown"),
                    "stream authenticated"
                );
            }
            ServerMessage::AuthInvalid { message } => {
                return Err(StreamError::AuthRejected(message.unwrap_or_default()));
            }
            other => {
                return Err(StreamError::Protocol(format!(
                    "expected auth result, got {other:?}"
                )))
            }
        }

        let mut next_id = 0u64;
        let mut subscription_ids = HashSet::new();
        for event_type in SUBSCRIBED_EVENT_TYPES {
            next_id += 1;
            send_frame(
                &mut write,
                &ClientMessage::SubscribeEvents {
                    id: next_id,
                    event_type: event_type.to_string(),
                },
            )
            .await?;
            subscription_ids.insert(next_id);
        }

        Ok(Session {
            write,
            read,
            next_id,
            subscription_ids,
        })
    }

    /// Main frame/command loop for one live connection.
    async fn serve(&mut self, session: Session) -> ServeExit {
        let Session {
            mut write,
            mut read,
            mut next_id,
            mut subscription_ids,
        } = session;

        let mut pending_registries: Option<PendingRegistries> = None;
        let mut pending_states: HashMap<u64, oneshot::Sender<Result<Vec<Value>, StreamError>>> =
            HashMap::new();

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        // Deadline for outstanding commands. A result frame dropped by the
        // server must not leave a caller awaiting its oneshot forever.
        let mut command_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    next_id += 1;
                    if send_frame(&mut write, &ClientMessage::Ping { id: next_id }).await.is_err() {
                        return ServeExit::Disconnected;
                    }
                }
                _ = async {
                    match command_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!("command results overdue, failing in-flight commands");
                    fail_pending(&mut pending_registries, &mut pending_states);
                    command_deadline = None;
                }
                cmd = self.commands.recv() => match cmd {
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return ServeExit::Shutdown;
                    }
                    Some(Command::FetchRegistries(reply)) => {
                        if pending_registries.is_some() {
                            let _ = reply.send(Err(StreamError::Busy));
                            continue;
                        }
                        let mut ids = HashMap::new();
                        let mut send_failed = false;
                        for kind in RegistryKind::ALL {
                            next_id += 1;
                            if send_frame(&mut write, &kind.list_command(next_id)).await.is_err() {
                                send_failed = true;
                                break;
                            }
                            ids.insert(next_id, kind);
                        }
                        if send_failed {
                            let _ = reply.send(Err(StreamError::ConnectionLost));
                            return ServeExit::Disconnected;
                        }
                        pending_registries = Some(PendingRegistries {
                            ids,
                            dump: RegistryDump::default(),
                            reply: Some(reply),
                        });
                        command_deadline = Some(tokio::time::Instant::now() + COMMAND_TIMEOUT);
                    }
                    Some(Command::FetchStates(reply)) => {
                        next_id += 1;
                        if send_frame(&mut write, &ClientMessage::GetStates { id: next_id }).await.is_err() {
                            let _ = reply.send(Err(StreamError::ConnectionLost));
                            return ServeExit::Disconnected;
                        }
                        pending_states.insert(next_id, reply);
                        command_deadline = Some(tokio::time::Instant::now() + COMMAND_TIMEOUT);
                    }
                },
                frame = read.next() => {
                    let msg = match frame {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(error = %e, "stream read error");
                            return ServeExit::Disconnected;
                        }
                        None => {
                            info!("stream closed by server");
                            return ServeExit::Disconnected;
                        }
                    };
                    match msg {
                        Message::Text(text) => {
                            let parsed: ServerMessage = match serde_json::from_str(&text) {
                                Ok(p) => p,
                                Err(e) => {
                                    debug!(error = %e, "skipping unrecognized frame");
                                    continue;
                                }
                            };
                            if dispatch_frame(
                                &self.events,
                                parsed,
                                &mut subscription_ids,
                                &mut pending_registries,
                                &mut pending_states,
                            )
                            .await
                            .is_err()
                            {
                                return ServeExit::Shutdown;
                            }
                            if pending_registries.is_none() && pending_states.is_empty() {
                                command_deadline = None;
                            }
                        }
                        Message::Ping(payload) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return ServeExit::Disconnected;
                            }
                        }
                        Message::Close(_) => {
                            info!("stream received close frame");
                            return ServeExit::Disconnected;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Sleep while rejecting commands arriving in the meantime.
    async fn answer_commands_until(&mut self, dur: Duration) -> WaitOutcome {
        let sleep = tokio::time::sleep(dur);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    Some(c) => c.reject(StreamError::NotConnected),
                    None => return WaitOutcome::Shutdown,
                },
            }
        }
    }

    /// Degraded mode: one connect attempt per probe interval.
    async fn probe_until_connected(&mut self) -> Option<Session> {
        loop {
            match self.answer_commands_until(DEGRADED_PROBE_INTERVAL).await {
                WaitOutcome::Shutdown => return None,
                WaitOutcome::Elapsed => {}
            }
            match self.establish().await {
                Ok(session) => {
                    info!("degraded probe succeeded");
                    return Some(session);
                }
                Err(e) => debug!(error = %e, "degraded probe failed"),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                debug!(?state, "connection state changed");
                *cur = state;
                true
            }
        });
    }
}

enum WaitOutcome {
    Elapsed,
    Shutdown,
}

struct Session {
    write: WsSink,
    read: WsSource,
    next_id: u64,
    subscription_ids: HashSet<u64>,
}

fn backoff_for(attempt: u32) -> Duration {
    RECONNECT_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(RECONNECT_CAP)
}

/// Reject every in-flight command. Used when result frames have stopped
/// arriving for them; callers get an error instead of waiting forever.
fn fail_pending(
    pending_registries: &mut Option<PendingRegistries>,
    pending_states: &mut HashMap<u64, oneshot::Sender<Result<Vec<Value>, StreamError>>>,
) {
    if let Some(mut pending) = pending_registries.take() {
        if let Some(reply) = pending.reply.take() {
            let _ = reply.send(Err(StreamError::Protocol(
                "registry listing timed out".to_string(),
            )));
        }
    }
    for (_, reply) in pending_states.drain() {
        let _ = reply.send(Err(StreamError::Protocol(
            "state dump timed out".to_string(),
        )));
    }
}

async fn send_frame(write: &mut WsSink, msg: &ClientMessage) -> Result<(), StreamError> {
    let text = serde_json::to_string(msg).map_err(|e| StreamError::Protocol(e.to_string()))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|_| StreamError::ConnectionLost)
}

async fn recv_handshake_frame(read: &mut WsSource) -> Result<ServerMessage, StreamError> {
    loop {
        let msg = timeout(HANDSHAKE_TIMEOUT, read.next())
            .await
            .map_err(|_| StreamError::Protocol("handshake timeout".to_string()))?
            .ok_or_else(|| StreamError::Protocol("closed during handshake".to_string()))?
            .map_err(|e| StreamError::Protocol(format!("handshake read: {e}")))?;
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| StreamError::Protocol(format!("handshake parse: {e}")))
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(StreamError::Protocol(format!(
                    "unexpected handshake frame: {other:?}"
                )))
            }
        }
    }
}

/// Route one parsed frame. `Err` means the event receiver is gone and the
/// task should stop.
async fn dispatch_frame(
    events: &mpsc::Sender<StreamEvent>,
    frame: ServerMessage,
    subscription_ids: &mut HashSet<u64>,
    pending_registries: &mut Option<PendingRegistries>,
    pending_states: &mut HashMap<u64, oneshot::Sender<Result<Vec<Value>, StreamError>>>,
) -> Result<(), ()> {
    match frame {
        ServerMessage::Result {
            id,
            success,
            mut result,
            error,
        } => {
            let failure = || match &error {
                Some(e) => StreamError::Command {
                    code: e.code.clone(),
                    message: e.message.clone(),
                },
                None => StreamError::Protocol("command failed without error".to_string()),
            };

            let mut registry_hit = false;
            if let Some(pending) = pending_registries.as_mut() {
                if let Some(kind) = pending.ids.remove(&id) {
                    registry_hit = true;
                    if success {
                        match result.take() {
                            Some(Value::Array(rows)) => pending.dump.set(kind, rows),
                            _ => {
                                // a listing must be a list; anything else poisons the batch
                                warn!(?kind, "registry listing returned a non-list result");
                                if let Some(reply) = pending.reply.take() {
                                    let _ = reply.send(Err(StreamError::Protocol(format!(
                                        "{kind:?} registry listing is not a list"
                                    ))));
                                }
                            }
                        }
                    } else {
                        let err = failure();
                        warn!(?kind, error = %err, "registry listing failed");
                        if let Some(reply) = pending.reply.take() {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
            }
            if registry_hit {
                let complete = pending_registries
                    .as_ref()
                    .map_or(false, |p| p.ids.is_empty());
                if complete {
                    if let Some(mut finished) = pending_registries.take() {
                        if let Some(reply) = finished.reply.take() {
                            let _ = reply.send(Ok(finished.dump));
                        }
                    }
                }
            } else if let Some(reply) = pending_states.remove(&id) {
                if success {
                    let _ = match result.take() {
                        Some(Value::Array(rows)) => reply.send(Ok(rows)),
                        _ => reply.send(Err(StreamError::Protocol(
                            "state dump is not a list".to_string(),
                        ))),
                    };
                } else {
                    let _ = reply.send(Err(failure()));
                }
            } else if subscription_ids.remove(&id) {
                if !success {
                    warn!(id, ?error, "event subscription rejected");
                }
            } else {
                debug!(id, "result frame for unknown command id");
            }
        }
        ServerMessage::Event { event, .. } => {
            if event.event_type == "state_changed" {
                match serde_json::from_value::<StateChangedData>(event.data) {
                    Ok(data) => {
                        if events.send(StreamEvent::StateChanged(data)).await.is_err() {
                            return Err(());
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping malformed state_changed event"),
                }
            } else if let Some(kind) = RegistryKind::from_event_type(&event.event_type) {
                if events
                    .send(StreamEvent::RegistryChanged(kind))
                    .await
                    .is_err()
                {
                    return Err(());
                }
            } else {
                debug!(event_type = %event.event_type, "ignoring event");
            }
        }
        ServerMessage::Pong { .. } => {}
        other => debug!(?other, "ignoring frame outside handshake"),
    }
    Ok(())
}
