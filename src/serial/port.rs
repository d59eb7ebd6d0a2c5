//! Serial device access.
//!
//! [`PortOpener`] is the seam between the transport loops and the device.
//! [`SystemPorts`] opens real devices through `serialport`; tests supply an
//! in-memory opener.

use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::constants::SERIAL_IO_TIMEOUT;

/// Independent read and write halves of one open device.
///
/// Dropping both halves closes the device.
pub struct SerialHandles {
    /// Read half. Reads time out with [`std::io::ErrorKind::TimedOut`]
    /// when no data arrives.
    pub reader: Box<dyn Read + Send>,
    /// Write half.
    pub writer: Box<dyn Write + Send>,
}

impl std::fmt::Debug for SerialHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialHandles").finish_non_exhaustive()
    }
}

/// Opens serial devices.
pub trait PortOpener: Send + Sync {
    /// Open `port_name` at `baud_rate`. Called from a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<SerialHandles>;
}

/// Opens devices on this machine: 8 data bits, 1 stop bit, no parity,
/// 500 ms read/write timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<SerialHandles> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(SERIAL_IO_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open serial port {port_name}"))?;

        let reader = port
            .try_clone()
            .with_context(|| format!("Failed to clone serial port {port_name}"))?;

        Ok(SerialHandles {
            reader: Box::new(reader),
            writer: Box::new(port),
        })
    }
}

/// A serial port present on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    /// Device name to pass to `open` (`/dev/ttyUSB0`, `COM3`).
    pub name: String,
    /// Product or bus description, if known.
    pub description: Option<String>,
}

/// List the serial ports present on this machine.
///
/// # Errors
///
/// Returns an error if the platform enumeration fails.
pub fn available_ports() -> Result<Vec<PortSummary>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(
                    usb.product
                        .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
                ),
                serialport::SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                serialport::SerialPortType::PciPort => Some("PCI".to_string()),
                serialport::SerialPortType::Unknown => None,
            };
            PortSummary {
                name: port.port_name,
                description,
            }
        })
        .collect())
}
