//! Relay orchestration.
//!
//! Owns the gateway session and the serial transport, and turns every
//! inbound command batch into `rftransmit` lines on the serial device.
//!
//! # Architecture
//!
//! ```text
//!   GatewayConnection ──events───► gateway forwarder ──┬─► state watch
//!                     ──commands─►                     └─► dispatch_batch ──► SerialTransport::control
//!   SerialTransport   ──events──► serial forwarder  ────► RelayEvent
//! ```
//!
//! Commands of one batch are dispatched in arrival order and the serial
//! transmit queue is FIFO, so they reach the device in that order.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::gateway::{ConnectOutcome, ConnectionState, DisposeReason, GatewayConnection, GatewayEvent};
use crate::lock_unpoisoned as lock;
use crate::protocol::{ControlCommand, ControlCommandBatch};
use crate::serial::{PortOpener, SerialEvent, SerialTransport};

/// Notification published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// The serial console buffer changed.
    ConsoleUpdated,
    /// The serial device was closed.
    SerialClosed,
    /// The gateway does not know the device; the hub session was dropped.
    DeviceNotFound,
}

struct GatewaySession {
    id: u64,
    connection: Arc<GatewayConnection>,
    forwarder: JoinHandle<()>,
}

struct SerialSession {
    transport: Arc<SerialTransport>,
    forwarder: JoinHandle<()>,
}

struct Inner {
    config: ConfigStore,
    opener: Arc<dyn PortOpener>,
    /// One hub session setup at a time.
    setup_lock: tokio::sync::Mutex<()>,
    port_lock: tokio::sync::Mutex<()>,
    gateway: Mutex<Option<GatewaySession>>,
    next_session: AtomicU64,
    serial: Mutex<Option<SerialSession>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<RelayEvent>,
}

/// Binds a gateway session to a serial transport.
#[derive(Clone)]
pub struct RelayOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOrchestrator")
            .field("state", &self.state())
            .field("serial_port", &self.serial_port())
            .finish_non_exhaustive()
    }
}

impl RelayOrchestrator {
    /// Create an orchestrator with no session and no port.
    pub fn new(config: ConfigStore, opener: Arc<dyn PortOpener>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                opener,
                setup_lock: tokio::sync::Mutex::new(()),
                port_lock: tokio::sync::Mutex::new(()),
                gateway: Mutex::new(None),
                next_session: AtomicU64::new(0),
                serial: Mutex::new(None),
                state,
                events,
            }),
        }
    }

    /// Reopen the configured port and reconnect the configured hub,
    /// as far as their auto-connect flags allow. Failures are logged.
    pub async fn auto_connect(&self) {
        let config = self.inner.config.get();

        if config.serial_auto_connect {
            if let Some(port) = &config.serial_port {
                if let Err(e) = self.select_port(port).await {
                    log::error!("[Relay] Could not reopen {port}: {e:#}");
                }
            }
        }

        if config.hub_auto_connect {
            if let Some(hub_id) = config.hub_id {
                match self.select_hub(hub_id).await {
                    Ok(Some(outcome)) => log::info!("[Relay] Hub connect: {outcome:?}"),
                    Ok(None) => {}
                    Err(e) => log::error!("[Relay] Could not start hub {hub_id}: {e:#}"),
                }
            }
        }
    }

    /// Relay for `hub_id`, replacing any current session.
    ///
    /// The id is persisted. A nil id stops the session and returns
    /// `Ok(None)`; otherwise the outcome of the first connect attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if no device token is configured or the session
    /// cannot be created.
    pub async fn select_hub(&self, hub_id: Uuid) -> Result<Option<ConnectOutcome>> {
        let _setup = self.inner.setup_lock.lock().await;

        self.inner
            .config
            .update(|c| c.hub_id = (!hub_id.is_nil()).then_some(hub_id));

        if hub_id.is_nil() {
            log::error!("[Relay] Hub id is empty, stopping connection");
            self.inner.stop_hub().await;
            return Ok(None);
        }

        let config = self.inner.config.get();
        if !config.has_token() {
            anyhow::bail!("No device token configured");
        }

        self.inner.stop_hub().await;

        log::info!("[Relay] Selected hub {hub_id}");
        let connection = Arc::new(GatewayConnection::new(
            &config.backend,
            &config.device_token,
        )?);
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let events = connection.subscribe();
        let commands = connection.commands();
        let forwarder =
            tokio::spawn(Arc::clone(&self.inner).forward_gateway(id, events, commands));
        *lock(&self.inner.gateway) = Some(GatewaySession {
            id,
            connection: Arc::clone(&connection),
            forwarder,
        });

        Ok(Some(connection.connect().await))
    }

    /// Dispose the hub session, if any.
    pub async fn stop_hub(&self) {
        let _setup = self.inner.setup_lock.lock().await;
        self.inner.stop_hub().await;
    }

    /// Switch to `port_name`, fully closing the previous port first.
    /// The port is persisted once it opens.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be opened.
    pub async fn select_port(&self, port_name: &str) -> Result<()> {
        let _guard = self.inner.port_lock.lock().await;
        self.inner.close_port().await;

        let baud_rate = self.inner.config.get().baud_rate;
        let transport = Arc::new(SerialTransport::new(Arc::clone(&self.inner.opener)));
        let events = transport.subscribe();
        transport.open(port_name, baud_rate).await?;

        let forwarder = tokio::spawn(Arc::clone(&self.inner).forward_serial(events));
        *lock(&self.inner.serial) = Some(SerialSession {
            transport,
            forwarder,
        });

        self.inner
            .config
            .update(|c| c.serial_port = Some(port_name.to_string()));
        Ok(())
    }

    /// Close the serial port, if any.
    pub async fn close_port(&self) {
        let _guard = self.inner.port_lock.lock().await;
        self.inner.close_port().await;
    }

    /// Send `batch` to the serial device in order. Commands that cannot be
    /// queued are logged and dropped. Returns how many were queued.
    pub fn dispatch_batch(&self, batch: &[ControlCommand]) -> usize {
        self.inner.dispatch_batch(batch)
    }

    /// Stop everything and write the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_hub().await;
        self.close_port().await;
        self.inner.config.flush().await
    }

    /// Current gateway connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the gateway connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to relay events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a hub session is held. A session the gateway disposed on
    /// its own is released as soon as its disposal is observed.
    pub fn has_hub_session(&self) -> bool {
        lock(&self.inner.gateway).is_some()
    }

    /// Name of the open serial port.
    pub fn serial_port(&self) -> Option<String> {
        lock(&self.inner.serial)
            .as_ref()
            .and_then(|s| s.transport.port_name())
    }

    /// Snapshot of the serial console.
    pub fn console_lines(&self) -> Vec<String> {
        self.inner
            .serial_transport()
            .map(|t| t.console_lines())
            .unwrap_or_default()
    }

    /// Completed console lines at or after `cursor`, and the next cursor.
    pub fn completed_console_lines_since(&self, cursor: u64) -> (Vec<String>, u64) {
        self.inner
            .serial_transport()
            .map_or((Vec::new(), cursor), |t| t.completed_lines_since(cursor))
    }

    /// Live configuration.
    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }
}

impl Inner {
    fn serial_transport(&self) -> Option<Arc<SerialTransport>> {
        lock(&self.serial)
            .as_ref()
            .map(|s| Arc::clone(&s.transport))
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    /// Caller holds `setup_lock`.
    async fn stop_hub(&self) {
        let session = lock(&self.gateway).take();
        let Some(session) = session else {
            return;
        };
        session.connection.dispose().await;
        session.forwarder.abort();
        let _ = session.forwarder.await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Caller holds `port_lock`.
    async fn close_port(&self) {
        let session = lock(&self.serial).take();
        let Some(session) = session else {
            return;
        };
        session.transport.dispose().await;
        session.forwarder.abort();
        let _ = session.forwarder.await;
    }

    fn dispatch_batch(&self, batch: &[ControlCommand]) -> usize {
        let Some(transport) = self.serial_transport() else {
            log::warn!(
                "[Relay] No serial port open, dropping {} command(s)",
                batch.len()
            );
            return 0;
        };

        let mut queued = 0;
        for command in batch {
            match transport.control(command) {
                Ok(()) => queued += 1,
                Err(e) => log::warn!(
                    "[Relay] Dropping command for shocker {}: {e:#}",
                    command.shocker_id
                ),
            }
        }
        queued
    }

    async fn forward_gateway(
        self: Arc<Self>,
        session: u64,
        mut events: broadcast::Receiver<GatewayEvent>,
        mut commands: mpsc::UnboundedReceiver<ControlCommandBatch>,
    ) {
        loop {
            tokio::select! {
                Some(batch) = commands.recv() => {
                    self.dispatch_batch(&batch);
                }
                event = events.recv() => match event {
                    Ok(GatewayEvent::StateChanged(state)) => self.set_state(state),
                    Ok(GatewayEvent::Disposed { reason }) => {
                        while let Ok(batch) = commands.try_recv() {
                            self.dispatch_batch(&batch);
                        }
                        self.set_state(ConnectionState::Disconnected);
                        if reason == DisposeReason::DeviceNotFound {
                            log::error!("[Relay] Hub session dropped: device not found");
                            let _ = self.events.send(RelayEvent::DeviceNotFound);
                        }
                        self.release_gateway(session);
                        return;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::debug!("[Relay] Missed {missed} gateway state event(s)");
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// Drop a disposed session if it still occupies the slot. Its
    /// forwarder handle is detached, not aborted, since this runs on it.
    fn release_gateway(&self, session: u64) {
        let dead = {
            let mut slot = lock(&self.gateway);
            if slot.as_ref().is_some_and(|s| s.id == session) {
                slot.take()
            } else {
                None
            }
        };
        if dead.is_some() {
            log::debug!("[Relay] Released disposed hub session {session}");
        }
    }

    async fn forward_serial(self: Arc<Self>, mut events: broadcast::Receiver<SerialEvent>) {
        loop {
            match events.recv().await {
                Ok(SerialEvent::ConsoleUpdated) => {
                    let _ = self.events.send(RelayEvent::ConsoleUpdated);
                }
                Ok(SerialEvent::Closed) => {
                    let _ = self.events.send(RelayEvent::SerialClosed);
                }
                Err(RecvError::Lagged(missed)) => {
                    log::debug!("[Relay] Coalesced {missed} serial event(s)");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}
