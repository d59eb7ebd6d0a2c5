//! Gateway connection manager.
//!
//! Keeps one framed binary socket session to a cloud gateway node alive and
//! publishes inbound command batches to subscribers.
//!
//! # Architecture
//!
//! ```text
//!   connect() ──► assignment (HTTP) ──► socket ──► Connected
//!                      │   │                │          │
//!                  403 │   │ 503 / error    │ 404      ├─ receive loop ──► command receivers
//!                      ▼   ▼                ▼          ├─ send loop    ◄── outbound queue (FIFO)
//!            Unauthorized  Reconnecting   dispose      └─ keepalive    ──► outbound queue
//!                              │
//!                              └─ close socket, wait 3 s, connect() again
//! ```
//!
//! # Cancellation
//!
//! The session owns a root [`CancellationToken`]. Every connect attempt
//! derives a child token that the three loops of that attempt share.
//! Cancelling the child retires one attempt; cancelling the root disposes
//! the session for good and no further attempt is scheduled.
//!
//! # Command delivery
//!
//! Inbound batches go to every receiver handed out by
//! [`GatewayConnection::commands`] over unbounded queues, so a slow
//! consumer delays commands but never loses them. State changes and
//! disposal travel on a broadcast channel where lagging is harmless.

// Rust guideline compliant 2026-02

pub mod assignment;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    self, EVENT_CHANNEL_CAPACITY, GATEWAY_SOCKET_PATH, KEEPALIVE_INTERVAL, RECONNECT_DELAY,
    SOCKET_CLOSE_TIMEOUT,
};
use crate::lock_unpoisoned as lock;
use crate::protocol::framing::{self, FrameSink, Received};
use crate::protocol::{ControlCommandBatch, GatewayToHub, HubToGateway};
use crate::ws::{self, WsReader, WsWriter};

pub use assignment::{Assignment, AssignmentClient, GatewayAssignment};

type SharedWriter = Arc<tokio::sync::Mutex<WsWriter>>;

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket. Initial state, and the state after disposal.
    #[default]
    Disconnected,
    /// An attempt is in progress.
    Connecting,
    /// The socket is up and the loops are running.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// The backend rejected the device token. No further automatic attempts.
    Unauthorized,
}

/// Why a session was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// [`GatewayConnection::dispose`] was called.
    Requested,
    /// The gateway does not know this device.
    DeviceNotFound,
}

/// Notification published to subscribers.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The session was disposed. Always the last event.
    Disposed {
        /// Cause of disposal.
        reason: DisposeReason,
    },
}

/// Result of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Socket up, loops running.
    Connected,
    /// The attempt failed transiently and a reconnect is scheduled.
    Reconnecting,
    /// The assignment request failed or returned garbage; a reconnect is scheduled.
    AssignmentFailed,
    /// HTTP 403 on assignment. Nothing is scheduled.
    Unauthorized,
    /// Socket handshake answered 404. The session has been disposed.
    DeviceNotFound,
    /// The session was already disposed.
    Disposed,
}

/// A live socket: its loops and the handles needed to close it.
struct Socket {
    writer: SharedWriter,
    outbound: mpsc::UnboundedSender<HubToGateway>,
    tasks: Vec<JoinHandle<()>>,
}

/// A scheduled reconnect, cancellable by a newer attempt or by disposal.
struct PendingReconnect {
    token: CancellationToken,
    _task: JoinHandle<()>,
}

struct Inner {
    assignment: AssignmentClient,
    device_token: String,
    user_agent: String,
    root: CancellationToken,
    attempt: Mutex<CancellationToken>,
    connect_lock: tokio::sync::Mutex<()>,
    socket: Mutex<Option<Socket>>,
    reconnect: Mutex<Option<PendingReconnect>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<GatewayEvent>,
    command_receivers: Mutex<Vec<mpsc::UnboundedSender<ControlCommandBatch>>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    disposed: AtomicBool,
}

/// Connection manager for one hub session.
///
/// Dropping the connection cancels the session; call
/// [`dispose`](Self::dispose) to also wait for the loops to stop.
pub struct GatewayConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("backend", &self.inner.assignment.backend())
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl GatewayConnection {
    /// Create a session for `backend` authenticating with `device_token`.
    /// Nothing happens on the network until [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(backend: &str, device_token: &str) -> Result<Self> {
        let root = CancellationToken::new();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                assignment: AssignmentClient::new(backend, device_token)?,
                device_token: device_token.to_string(),
                user_agent: constants::user_agent(),
                attempt: Mutex::new(root.child_token()),
                root,
                connect_lock: tokio::sync::Mutex::new(()),
                socket: Mutex::new(None),
                reconnect: Mutex::new(None),
                state,
                events,
                command_receivers: Mutex::new(Vec::new()),
                connected_at: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Run one connect attempt. Transient failures schedule a reconnect
    /// in the background before this returns.
    pub async fn connect(&self) -> ConnectOutcome {
        Inner::connect(Arc::clone(&self.inner)).await
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    /// Receive every inbound command batch from now on, in arrival order.
    ///
    /// The queue is unbounded and closes once the session is disposed and
    /// all batches received before disposal have been drained.
    pub fn commands(&self) -> mpsc::UnboundedReceiver<ControlCommandBatch> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.command_receivers).push(sender);
        receiver
    }

    /// Queue a message for the gateway. Messages go out in queue order.
    ///
    /// # Errors
    ///
    /// Returns an error if no socket is connected.
    pub fn enqueue(&self, message: HubToGateway) -> Result<()> {
        let socket = lock(&self.inner.socket);
        let Some(socket) = socket.as_ref() else {
            anyhow::bail!("Gateway is not connected");
        };
        socket
            .outbound
            .send(message)
            .map_err(|e| anyhow::anyhow!("Gateway send loop has stopped: {:?}", e.0))
    }

    /// When the current socket connected.
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.connected_at)
    }

    /// Whether the session has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Dispose the session: stop every loop, close the socket and emit
    /// [`GatewayEvent::Disposed`]. Idempotent.
    pub async fn dispose(&self) {
        self.inner.dispose(DisposeReason::Requested).await;
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

impl Inner {
    fn connect(self: Arc<Self>) -> BoxFuture<'static, ConnectOutcome> {
        async move { self.run_attempt().await }.boxed()
    }

    async fn run_attempt(self: Arc<Self>) -> ConnectOutcome {
        if self.root.is_cancelled() {
            return ConnectOutcome::Disposed;
        }
        let _guard = self.connect_lock.lock().await;
        if self.root.is_cancelled() {
            return ConnectOutcome::Disposed;
        }

        // A newer attempt supersedes any reconnect still waiting out its delay.
        if let Some(pending) = lock(&self.reconnect).take() {
            pending.token.cancel();
        }

        self.set_state(ConnectionState::Connecting);
        let attempt = self.begin_attempt();
        self.close_socket().await;

        let requested = tokio::select! {
            () = attempt.cancelled() => return ConnectOutcome::Disposed,
            requested = self.assignment.request() => requested,
        };

        let assigned = match requested {
            Ok(Assignment::Assigned(assigned)) => assigned,
            Ok(Assignment::Unauthorized) => {
                log::error!("[Gateway] Device token rejected (403), not retrying");
                attempt.cancel();
                self.set_state(ConnectionState::Unauthorized);
                return ConnectOutcome::Unauthorized;
            }
            Ok(Assignment::Unavailable) => {
                log::warn!("[Gateway] No gateway available (503)");
                self.schedule_reconnect(&attempt);
                return ConnectOutcome::Reconnecting;
            }
            Err(e) => {
                log::warn!("[Gateway] Endpoint assignment failed: {e:#}");
                self.schedule_reconnect(&attempt);
                return ConnectOutcome::AssignmentFailed;
            }
        };

        match &assigned.country {
            Some(country) => log::info!(
                "[Gateway] Assigned gateway {} ({country})",
                assigned.endpoint_host
            ),
            None => log::info!("[Gateway] Assigned gateway {}", assigned.endpoint_host),
        }

        let url = self.socket_url(&assigned.endpoint_host);
        let headers = [
            (constants::DEVICE_TOKEN_HEADER, self.device_token.as_str()),
            ("User-Agent", self.user_agent.as_str()),
        ];

        let opened = tokio::select! {
            () = attempt.cancelled() => return ConnectOutcome::Disposed,
            opened = ws::connect(&url, &headers) => opened,
        };

        let (writer, reader) = match opened {
            Ok(halves) => halves,
            Err(e) if ws::is_not_found(&e) => {
                log::error!("[Gateway] Gateway does not know this device (404), disposing session");
                self.root.cancel();
                self.finish_dispose(DisposeReason::DeviceNotFound).await;
                return ConnectOutcome::DeviceNotFound;
            }
            Err(e) => {
                log::warn!("[Gateway] Socket connect to {url} failed: {e:#}");
                self.schedule_reconnect(&attempt);
                return ConnectOutcome::Reconnecting;
            }
        };

        self.set_state(ConnectionState::Connected);
        let connected_at = Instant::now();
        *lock(&self.connected_at) = Some(Utc::now());

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let (outbound, queue) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(Arc::clone(&self).receive_loop(
                reader,
                Arc::clone(&writer),
                attempt.clone(),
            )),
            tokio::spawn(Arc::clone(&self).send_loop(queue, Arc::clone(&writer), attempt.clone())),
            tokio::spawn(keepalive_loop(outbound.clone(), connected_at, attempt)),
        ];
        *lock(&self.socket) = Some(Socket {
            writer,
            outbound,
            tasks,
        });

        log::info!("[Gateway] Connected to {url}");
        ConnectOutcome::Connected
    }

    /// Retire the previous attempt's scope and open a fresh one under the root.
    fn begin_attempt(&self) -> CancellationToken {
        let fresh = self.root.child_token();
        let previous = std::mem::replace(&mut *lock(&self.attempt), fresh.clone());
        previous.cancel();
        fresh
    }

    /// Socket URL for an assigned host. The scheme follows the backend:
    /// an `http://` backend yields `ws://`, anything else `wss://`.
    fn socket_url(&self, host: &str) -> String {
        let scheme = if self.assignment.backend().starts_with("http://") {
            "http"
        } else {
            "https"
        };
        ws::http_to_ws_scheme(&format!("{scheme}://{host}{GATEWAY_SOCKET_PATH}"))
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::debug!("[Gateway] State {current:?} -> {next:?}");
            *current = next;
            // Published under the watch lock so observers see transitions in order.
            let _ = self.events.send(GatewayEvent::StateChanged(next));
            true
        });
    }

    /// Stop the loops of the current socket and close it.
    async fn close_socket(&self) {
        let Some(socket) = lock(&self.socket).take() else {
            return;
        };
        *lock(&self.connected_at) = None;

        for task in &socket.tasks {
            task.abort();
        }
        for task in socket.tasks {
            let _ = task.await;
        }

        let writer = socket.writer;
        let closed = tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, async move {
            writer.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => log::debug!("[Gateway] Socket closed"),
            Ok(Err(e)) => log::debug!("[Gateway] Socket close failed: {e:#}"),
            Err(_) => log::debug!("[Gateway] Socket close timed out"),
        }
    }

    /// Schedule a reconnect for `attempt`, once.
    ///
    /// The first loop of an attempt to fail wins; later callers, and calls
    /// for an attempt that was cancelled locally, are ignored.
    fn schedule_reconnect(self: &Arc<Self>, attempt: &CancellationToken) {
        let mut slot = lock(&self.reconnect);
        if attempt.is_cancelled() || self.root.is_cancelled() {
            return;
        }
        attempt.cancel();
        self.set_state(ConnectionState::Reconnecting);

        let token = self.root.child_token();
        let inner = Arc::clone(self);
        let waiting = token.clone();
        let task = tokio::spawn(async move {
            {
                let _guard = inner.connect_lock.lock().await;
                if waiting.is_cancelled() {
                    return;
                }
                inner.close_socket().await;
            }

            log::warn!(
                "[Gateway] Reconnecting in {}s",
                RECONNECT_DELAY.as_secs()
            );
            tokio::select! {
                () = waiting.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }

            let outcome = inner.connect().await;
            log::debug!("[Gateway] Reconnect attempt finished: {outcome:?}");
        });

        if let Some(previous) = slot.replace(PendingReconnect { token, _task: task }) {
            previous.token.cancel();
        }
    }

    async fn dispose(&self, reason: DisposeReason) {
        self.root.cancel();
        let _guard = self.connect_lock.lock().await;
        self.finish_dispose(reason).await;
    }

    /// Tear everything down. The caller holds `connect_lock` and has
    /// cancelled the root.
    async fn finish_dispose(&self, reason: DisposeReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pending) = lock(&self.reconnect).take() {
            pending.token.cancel();
        }
        self.close_socket().await;
        lock(&self.command_receivers).clear();
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(GatewayEvent::Disposed { reason });
        log::info!("[Gateway] Session disposed ({reason:?})");
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: WsReader,
        writer: SharedWriter,
        attempt: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                () = attempt.cancelled() => break,
                received = framing::receive::<GatewayToHub, _, _>(&mut reader, &writer) => received,
            };

            match received {
                Ok(Received::Message(GatewayToHub::ShockerCommandList { commands })) => {
                    log::trace!("[Gateway] Received {} command(s)", commands.len());
                    lock(&self.command_receivers)
                        .retain(|receiver| receiver.send(commands.clone()).is_ok());
                }
                Ok(Received::DeserializeFailed { error, description }) => {
                    log::warn!("[Gateway] Dropping undecodable {description}: {error:#}");
                }
                Ok(Received::Closed) => {
                    log::info!("[Gateway] Socket closed by gateway");
                    break;
                }
                Err(e) => {
                    log::warn!("[Gateway] Receive failed: {e}");
                    break;
                }
            }
        }

        self.schedule_reconnect(&attempt);
    }

    async fn send_loop<S: FrameSink>(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<HubToGateway>,
        writer: Arc<tokio::sync::Mutex<S>>,
        attempt: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                () = attempt.cancelled() => return,
                message = queue.recv() => message,
            };
            let Some(message) = message else {
                return;
            };

            let sent = {
                let mut writer = writer.lock().await;
                framing::send(&message, &mut *writer).await
            };
            if let Err(e) = sent {
                log::warn!("[Gateway] Send failed: {e}");
                self.schedule_reconnect(&attempt);
                return;
            }
            log::trace!("[Gateway] Sent {message:?}");
        }
    }
}

/// Queue a keepalive right away and then every [`KEEPALIVE_INTERVAL`].
async fn keepalive_loop(
    outbound: mpsc::UnboundedSender<HubToGateway>,
    connected_at: Instant,
    attempt: CancellationToken,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = attempt.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let uptime_seconds = connected_at.elapsed().as_secs();
        match outbound.send(HubToGateway::KeepAlive { uptime_seconds }) {
            Ok(()) => log::debug!("[Gateway] Keepalive queued (uptime {uptime_seconds}s)"),
            Err(_) => log::warn!("[Gateway] Keepalive dropped, send loop has stopped"),
        }
    }
}
