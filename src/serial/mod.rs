//! Serial transport to the RF transmitter hub.
//!
//! # Architecture
//!
//! ```text
//!   control(cmd) ──► rftransmit line ──► transmit queue ──► transmit loop ──► device
//!
//!   device ──► receive loop (blocking thread) ──► ConsoleBuffer
//!                                   │
//!                                   └─► notifier (20 ms window) ──► SerialEvent::ConsoleUpdated
//!
//!   liveness loop (100 ms) ── device gone? ──► cancel session, SerialEvent::Closed
//! ```
//!
//! Each [`SerialTransport::open`] creates a session scope under the
//! transport's root scope. Opening again retires the previous session
//! first, so at most one device handle is ever open.

// Rust guideline compliant 2026-02

pub mod console;
pub mod port;
pub mod rftransmit;

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CONSOLE_NOTIFY_WINDOW, EVENT_CHANNEL_CAPACITY, SERIAL_LIVENESS_POLL, SERIAL_READ_CHUNK,
};
use crate::lock_unpoisoned as lock;
use crate::protocol::ControlCommand;

pub use console::ConsoleBuffer;
pub use port::{available_ports, PortOpener, PortSummary, SerialHandles, SystemPorts};

/// Notification published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEvent {
    /// New console text was buffered. Bursts are coalesced.
    ConsoleUpdated,
    /// The open session ended, locally or because the device went away.
    /// Raised once per session.
    Closed,
}

/// State shared by the loops of one open session.
struct SessionShared {
    port_name: String,
    token: CancellationToken,
    open: AtomicBool,
    closed_raised: AtomicBool,
    events: broadcast::Sender<SerialEvent>,
}

impl SessionShared {
    fn raise_closed(&self) {
        if !self.closed_raised.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SerialEvent::Closed);
        }
    }
}

struct Session {
    shared: Arc<SessionShared>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Cancel the loops, wait for them to release the device, raise `Closed`.
    async fn shutdown(self) {
        self.shared.token.cancel();
        self.shared.open.store(false, Ordering::SeqCst);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::debug!("[Serial] Loop ended abnormally: {e}");
            }
        }
        self.shared.raise_closed();
        log::info!("[Serial] Closed {}", self.shared.port_name);
    }
}

struct Inner {
    opener: Arc<dyn PortOpener>,
    root: CancellationToken,
    open_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    console: Arc<Mutex<ConsoleBuffer>>,
    events: broadcast::Sender<SerialEvent>,
}

/// Owns at most one open serial device and its loops.
pub struct SerialTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port_name())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new(Arc::new(SystemPorts))
    }
}

impl SerialTransport {
    /// Create a transport that opens devices through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                opener,
                root: CancellationToken::new(),
                open_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
                console: Arc::new(Mutex::new(ConsoleBuffer::default())),
                events,
            }),
        }
    }

    /// Open `port_name`, closing any device opened earlier.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was disposed or the device
    /// cannot be opened.
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> Result<()> {
        let inner = &self.inner;
        if inner.root.is_cancelled() {
            anyhow::bail!("Serial transport has been disposed");
        }
        let _guard = inner.open_lock.lock().await;

        let previous = lock(&inner.session).take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let opener = Arc::clone(&inner.opener);
        let name = port_name.to_string();
        let handles = tokio::task::spawn_blocking(move || opener.open(&name, baud_rate))
            .await
            .context("Serial open task failed")??;

        if inner.root.is_cancelled() {
            anyhow::bail!("Serial transport has been disposed");
        }

        let shared = Arc::new(SessionShared {
            port_name: port_name.to_string(),
            token: inner.root.child_token(),
            open: AtomicBool::new(true),
            closed_raised: AtomicBool::new(false),
            events: inner.events.clone(),
        });
        let (outbound, queue) = mpsc::unbounded_channel();
        let updated = Arc::new(Notify::new());

        let SerialHandles { reader, writer } = handles;
        let tasks = vec![
            tokio::spawn(transmit_loop(writer, queue, Arc::clone(&shared))),
            tokio::task::spawn_blocking({
                let shared = Arc::clone(&shared);
                let console = Arc::clone(&inner.console);
                let updated = Arc::clone(&updated);
                move || receive_loop(reader, &shared, &console, &updated)
            }),
            tokio::spawn(notify_loop(updated, Arc::clone(&shared))),
            tokio::spawn(liveness_loop(Arc::clone(&shared))),
        ];

        *lock(&inner.session) = Some(Session {
            shared,
            outbound,
            tasks,
        });

        log::info!("[Serial] Opened {port_name} at {baud_rate} baud");
        Ok(())
    }

    /// Queue `command` for the device as an `rftransmit` line.
    ///
    /// # Errors
    ///
    /// Returns an error if no device is open or the command cannot be
    /// encoded. The command is dropped either way.
    pub fn control(&self, command: &ControlCommand) -> Result<()> {
        let line = rftransmit::encode(command)?;

        let session = lock(&self.inner.session);
        let Some(session) = session.as_ref().filter(|s| !s.shared.token.is_cancelled()) else {
            anyhow::bail!("No serial port is open");
        };
        log::debug!(
            "[Serial] Queued {}",
            String::from_utf8_lossy(&line).trim_end()
        );
        session
            .outbound
            .send(line)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Serial transmit loop has stopped, dropped {} bytes",
                    e.0.len()
                )
            })
    }

    /// Close the device. Idempotent.
    pub async fn close(&self) {
        let _guard = self.inner.open_lock.lock().await;
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Close the device and refuse further opens. Idempotent.
    pub async fn dispose(&self) {
        self.inner.root.cancel();
        self.close().await;
    }

    /// Whether a device is open and alive.
    pub fn is_open(&self) -> bool {
        lock(&self.inner.session)
            .as_ref()
            .is_some_and(|s| s.shared.open.load(Ordering::SeqCst))
    }

    /// Name of the open device.
    pub fn port_name(&self) -> Option<String> {
        lock(&self.inner.session)
            .as_ref()
            .map(|s| s.shared.port_name.clone())
    }

    /// Snapshot of the console, oldest line first.
    pub fn console_lines(&self) -> Vec<String> {
        lock(&self.inner.console).lines().map(str::to_string).collect()
    }

    /// Completed console lines at or after `cursor`, and the next cursor.
    pub fn completed_lines_since(&self, cursor: u64) -> (Vec<String>, u64) {
        lock(&self.inner.console).completed_since(cursor)
    }

    /// Subscribe to events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SerialEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

async fn transmit_loop(
    mut writer: Box<dyn Write + Send>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<SessionShared>,
) {
    loop {
        let item = tokio::select! {
            () = shared.token.cancelled() => return,
            item = queue.recv() => item,
        };
        let Some(item) = item else {
            return;
        };

        let written = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&item).and_then(|()| writer.flush());
            (writer, result)
        })
        .await;

        match written {
            Ok((returned, result)) => {
                writer = returned;
                if let Err(e) = result {
                    log::error!("[Serial] Write to {} failed: {e}", shared.port_name);
                }
            }
            Err(e) => {
                log::error!("[Serial] Write task failed: {e}");
                return;
            }
        }
    }
}

/// Blocking read loop. Exits when the session is cancelled or the device
/// stops responding, clearing the open flag in the latter case.
fn receive_loop(
    mut reader: Box<dyn Read + Send>,
    shared: &SessionShared,
    console: &Mutex<ConsoleBuffer>,
    updated: &Notify,
) {
    let mut chunk = vec![0u8; SERIAL_READ_CHUNK];

    while !shared.token.is_cancelled() {
        match reader.read(&mut chunk) {
            Ok(0) => {
                log::warn!("[Serial] {} reached end of stream", shared.port_name);
                break;
            }
            Ok(n) => {
                let text = console::decode_ascii(&chunk[..n]);
                lock(console).push_text(&text);
                updated.notify_one();
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                if !shared.token.is_cancelled() {
                    log::error!("[Serial] Read from {} failed: {e}", shared.port_name);
                }
                break;
            }
        }
    }

    shared.open.store(false, Ordering::SeqCst);
}

/// Publish at most one `ConsoleUpdated` per notification window.
async fn notify_loop(updated: Arc<Notify>, shared: Arc<SessionShared>) {
    loop {
        tokio::select! {
            () = shared.token.cancelled() => return,
            () = updated.notified() => {}
        }
        tokio::select! {
            () = shared.token.cancelled() => {}
            () = tokio::time::sleep(CONSOLE_NOTIFY_WINDOW) => {}
        }
        let _ = shared.events.send(SerialEvent::ConsoleUpdated);
    }
}

async fn liveness_loop(shared: Arc<SessionShared>) {
    let mut ticker = tokio::time::interval(SERIAL_LIVENESS_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !shared.open.load(Ordering::SeqCst) {
            log::warn!("[Serial] {} closed unexpectedly", shared.port_name);
            shared.token.cancel();
            shared.raise_closed();
            return;
        }
    }
}
