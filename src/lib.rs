//! Local Relay - gateway-to-serial command relay.
//!
//! This crate connects a hub to its cloud gateway and forwards the control
//! commands it receives to an RF transmitter attached over serial, while
//! capturing the transmitter's console output.
//!
//! # Architecture
//!
//! - **Gateway** - endpoint assignment, framed socket session, keepalive, reconnect
//! - **Framing** - fragmenting and reassembling binary gateway messages
//! - **Serial** - device handle, transmit/receive/liveness loops, console buffer
//! - **Relay** - binds the two, owns their lifecycles
//!
//! # Modules
//!
//! - [`gateway`] - Gateway connection manager
//! - [`protocol`] - Gateway message schema and framing
//! - [`serial`] - Serial transport
//! - [`relay`] - Orchestration
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod config;
pub mod constants;
pub mod gateway;
pub mod protocol;
pub mod relay;
pub mod serial;
pub mod ws;

pub use config::{Config, ConfigStore};
pub use gateway::{ConnectOutcome, ConnectionState, GatewayConnection, GatewayEvent};
pub use protocol::{ControlCommand, ControlCommandBatch, ShockerCommandType, ShockerModel};
pub use relay::{RelayEvent, RelayOrchestrator};
pub use serial::{SerialEvent, SerialTransport};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
