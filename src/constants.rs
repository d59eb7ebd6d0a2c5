//! Application-wide constants for local-relay.
//!
//! This module centralizes all magic numbers and protocol constants so the
//! gateway, framing and serial layers agree on one set of values.
//!
//! # Categories
//!
//! - **Gateway**: keepalive cadence, reconnect backoff, HTTP timeouts
//! - **Framing**: message size cap and chunk sizes
//! - **Serial**: port settings, poll intervals, console capacity
//! - **Config**: persistence debounce

use std::time::Duration;

// ============================================================================
// Gateway
// ============================================================================

/// Interval between keepalive frames while connected.
///
/// The first keepalive is sent immediately on reaching `Connected`.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Fixed delay before a reconnect attempt.
///
/// Retries are unlimited while the session is not disposed.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// HTTP client request timeout for the endpoint assignment call.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the endpoint assignment call, relative to the backend URL.
pub const ASSIGNMENT_PATH: &str = "/1/device/assignLCG";

/// Path of the device socket on the assigned gateway node.
pub const GATEWAY_SOCKET_PATH: &str = "/1/ws/device";

/// Header carrying the hub's device token (HTTP and socket handshake).
pub const DEVICE_TOKEN_HEADER: &str = "Device-Token";

/// Upper bound on the graceful close of a retired socket.
pub const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffered events per gateway or serial subscriber before it lags.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default backend base URL.
pub const DEFAULT_BACKEND: &str = "https://api.openshock.app";

// ============================================================================
// Framing
// ============================================================================

/// Hard cap on a single encoded or accumulated gateway message (bytes).
pub const MAX_MESSAGE_SIZE: usize = 512_000;

/// Outbound messages are written in fragments of at most this many bytes.
pub const SEND_CHUNK_SIZE: usize = 1024;

/// Initial capacity of the receive accumulation buffer.
pub const RECEIVE_SCRATCH_SIZE: usize = 4096;

/// Number of idle scratch buffers kept by the framing pool.
pub const SCRATCH_POOL_LIMIT: usize = 8;

// ============================================================================
// Serial
// ============================================================================

/// Default baud rate of the RF transmitter hub.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read and write timeout of the serial device.
pub const SERIAL_IO_TIMEOUT: Duration = Duration::from_millis(500);

/// How often the liveness loop checks whether the device is still open.
pub const SERIAL_LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Size of the serial read chunk.
pub const SERIAL_READ_CHUNK: usize = 4096;

/// Number of console lines retained from the device.
pub const CONSOLE_CAPACITY: usize = 1000;

/// Quiet window used to coalesce console-updated notifications.
pub const CONSOLE_NOTIFY_WINDOW: Duration = Duration::from_millis(20);

// ============================================================================
// Config
// ============================================================================

/// Quiet period before a requested config save is written.
pub const CONFIG_SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Crate version, used in the `User-Agent`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the `User-Agent` sent on the gateway handshake.
///
/// Format: `<client>/<version> (<runtime>; <os>; <app name> <app version>)`.
#[must_use]
pub fn user_agent() -> String {
    format!(
        "LocalRelay.Live/{VERSION} (tokio; {} {}; {} {VERSION})",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_NAME"),
    )
}
