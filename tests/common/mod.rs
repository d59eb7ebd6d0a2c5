//! Shared fakes for integration tests: an in-memory serial device and an
//! in-process gateway socket server.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use local_relay::serial::{PortOpener, SerialHandles};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// Serial
// ============================================================================

/// Test-side handle of one opened in-memory device.
#[derive(Clone)]
pub struct MemoryPort {
    pub name: String,
    input: Arc<Mutex<Option<std_mpsc::Sender<Vec<u8>>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl MemoryPort {
    /// Bytes the device "prints".
    pub fn feed(&self, bytes: &[u8]) {
        if let Some(tx) = self.input.lock().unwrap().as_ref() {
            tx.send(bytes.to_vec()).unwrap();
        }
    }

    /// Simulate the device disappearing: reads hit end of stream.
    pub fn unplug(&self) {
        self.input.lock().unwrap().take();
    }

    /// Everything written to the device so far.
    pub fn written_text(&self) -> String {
        String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether the transport dropped its read half.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

struct MemoryReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    released: Arc<AtomicBool>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(bytes) => self.pending = bytes,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

struct MemoryWriter {
    written: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens in-memory devices. Names starting with `missing` fail to open.
#[derive(Default)]
pub struct MemoryOpener {
    opened: Mutex<Vec<MemoryPort>>,
}

impl MemoryOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Devices opened so far, oldest first.
    pub fn opened(&self) -> Vec<MemoryPort> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last(&self) -> MemoryPort {
        self.opened().pop().expect("no port opened")
    }
}

impl PortOpener for MemoryOpener {
    fn open(&self, port_name: &str, _baud_rate: u32) -> anyhow::Result<SerialHandles> {
        if port_name.starts_with("missing") {
            anyhow::bail!("Failed to open serial port {port_name}");
        }

        let (tx, rx) = std_mpsc::channel();
        let port = MemoryPort {
            name: port_name.to_string(),
            input: Arc::new(Mutex::new(Some(tx))),
            written: Arc::default(),
            fail_writes: Arc::default(),
            released: Arc::default(),
        };
        let handles = SerialHandles {
            reader: Box::new(MemoryReader {
                rx,
                pending: Vec::new(),
                released: Arc::clone(&port.released),
            }),
            writer: Box::new(MemoryWriter {
                written: Arc::clone(&port.written),
                fail_writes: Arc::clone(&port.fail_writes),
            }),
        };
        self.opened.lock().unwrap().push(port);
        Ok(handles)
    }
}

/// Poll `check` every 10 ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Gateway
// ============================================================================

/// How the fake gateway treats each incoming socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Complete the handshake and keep the socket open.
    Accept,
    /// Complete the handshake, send the greeting, then close.
    AcceptThenClose,
    /// Answer the handshake with HTTP 404.
    RejectNotFound,
}

/// An in-process gateway node.
pub struct FakeGateway {
    pub addr: SocketAddr,
    /// Binary messages received from clients, reassembled.
    pub received: mpsc::UnboundedReceiver<Vec<u8>>,
    /// When each handshake arrived.
    pub accepts: Arc<Mutex<Vec<Instant>>>,
    /// Lower-cased request headers of each handshake.
    pub headers: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl FakeGateway {
    pub fn accept_count(&self) -> usize {
        self.accepts.lock().unwrap().len()
    }

    /// Host to hand out in the assignment response.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

/// Start a gateway on `127.0.0.1:0` that sends `greeting` to every client.
pub async fn spawn_gateway(mode: GatewayMode, greeting: Vec<Vec<u8>>) -> FakeGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, received) = mpsc::unbounded_channel();
    let accepts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let headers: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();

    let (server_accepts, server_headers) = (Arc::clone(&accepts), Arc::clone(&headers));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_accepts.lock().unwrap().push(Instant::now());
            let tx = tx.clone();
            let seen_headers = Arc::clone(&server_headers);
            let greeting = greeting.clone();

            tokio::spawn(async move {
                let callback = move |request: &Request, response: Response| {
                    let seen = request
                        .headers()
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.as_str().to_ascii_lowercase(),
                                v.to_str().unwrap_or_default().to_string(),
                            )
                        })
                        .collect();
                    seen_headers.lock().unwrap().push(seen);

                    if mode == GatewayMode::RejectNotFound {
                        let mut rejection = ErrorResponse::new(Some("unknown device".to_string()));
                        *rejection.status_mut() = StatusCode::NOT_FOUND;
                        return Err(rejection);
                    }
                    Ok(response)
                };

                let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let (mut sink, mut stream) = socket.split();

                for message in greeting {
                    if sink.send(Message::Binary(message)).await.is_err() {
                        return;
                    }
                }
                if mode == GatewayMode::AcceptThenClose {
                    let _ = sink.send(Message::Close(None)).await;
                }

                while let Some(Ok(message)) = stream.next().await {
                    if let Message::Binary(bytes) = message {
                        let _ = tx.send(bytes.to_vec());
                    }
                }
            });
        }
    });

    FakeGateway {
        addr,
        received,
        accepts,
        headers,
    }
}
