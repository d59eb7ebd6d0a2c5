//! Binary gateway message schema.
//!
//! Every message is a variant tag followed by a fixed-layout,
//! little-endian payload:
//!
//! ```text
//! HubToGateway:  [u8 tag]
//!   0x01 KeepAlive          [u64 LE uptime_seconds]
//!
//! GatewayToHub:  [u8 tag]
//!   0x01 ShockerCommandList [u32 LE count] count × command
//!
//! command:       [u16 LE id][u8 model][u8 type][u8 intensity][u16 LE duration_ms]
//! ```
//!
//! See [`framing`] for how encoded messages travel over the socket.

pub mod framing;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Variant tags.
pub mod tag {
    /// Hub → gateway keepalive.
    pub const KEEP_ALIVE: u8 = 0x01;
    /// Gateway → hub control command batch.
    pub const SHOCKER_COMMAND_LIST: u8 = 0x01;
}

/// Encoded size of a single [`ControlCommand`].
const COMMAND_SIZE: usize = 7;

/// A message type that can be carried by the framing layer.
pub trait WireMessage: Sized {
    /// Upper bound of the encoded size of `self`.
    fn max_encoded_len(&self) -> usize;

    /// Encode into `buf` (at least [`Self::max_encoded_len`] bytes long),
    /// returning the number of bytes written.
    fn encode_into(&self, buf: &mut [u8]) -> usize;

    /// Decode one complete message.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Encode into a freshly allocated vector.
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.max_encoded_len()];
        let written = self.encode_into(&mut buf);
        buf.truncate(written);
        buf
    }
}

/// Model of the addressed shocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShockerModel {
    /// CaiXianlin receivers.
    #[serde(rename = "caixianlin")]
    CaiXianlin,
    /// PETtrainer receivers.
    #[serde(rename = "petrainer")]
    PetTrainer,
}

impl ShockerModel {
    fn to_wire(self) -> u8 {
        match self {
            Self::CaiXianlin => 0,
            Self::PetTrainer => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::CaiXianlin),
            1 => Ok(Self::PetTrainer),
            other => bail!("Unknown shocker model: {other}"),
        }
    }
}

/// Action a shocker performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShockerCommandType {
    /// Stop any running action.
    Stop,
    /// Electric stimulus.
    Shock,
    /// Vibration.
    Vibrate,
    /// Beep.
    Sound,
}

impl ShockerCommandType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Shock => 1,
            Self::Vibrate => 2,
            Self::Sound => 3,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Stop),
            1 => Ok(Self::Shock),
            2 => Ok(Self::Vibrate),
            3 => Ok(Self::Sound),
            other => bail!("Unknown shocker command type: {other}"),
        }
    }
}

/// One instruction for one shocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCommand {
    /// Shocker id on the RF link.
    pub shocker_id: u16,
    /// Receiver model.
    pub model: ShockerModel,
    /// Action to perform.
    pub command_type: ShockerCommandType,
    /// Intensity, 0–255.
    pub intensity: u8,
    /// Duration in milliseconds.
    pub duration_ms: u16,
}

impl ControlCommand {
    fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.shocker_id.to_le_bytes());
        buf[2] = self.model.to_wire();
        buf[3] = self.command_type.to_wire();
        buf[4] = self.intensity;
        buf[5..7].copy_from_slice(&self.duration_ms.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            shocker_id: u16::from_le_bytes([buf[0], buf[1]]),
            model: ShockerModel::from_wire(buf[2])?,
            command_type: ShockerCommandType::from_wire(buf[3])?,
            intensity: buf[4],
            duration_ms: u16::from_le_bytes([buf[5], buf[6]]),
        })
    }
}

/// Commands received in one inbound frame, in arrival order.
pub type ControlCommandBatch = Vec<ControlCommand>;

/// Messages the hub sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubToGateway {
    /// Liveness frame.
    KeepAlive {
        /// Seconds since the socket connected.
        uptime_seconds: u64,
    },
}

impl WireMessage for HubToGateway {
    fn max_encoded_len(&self) -> usize {
        match self {
            Self::KeepAlive { .. } => 1 + 8,
        }
    }

    fn encode_into(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::KeepAlive { uptime_seconds } => {
                buf[0] = tag::KEEP_ALIVE;
                buf[1..9].copy_from_slice(&uptime_seconds.to_le_bytes());
                9
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&kind, payload)) = bytes.split_first() else {
            bail!("Empty message");
        };
        match kind {
            tag::KEEP_ALIVE => {
                let raw = <[u8; 8]>::try_from(payload).with_context(|| {
                    format!("KeepAlive payload must be 8 bytes, got {}", payload.len())
                })?;
                Ok(Self::KeepAlive {
                    uptime_seconds: u64::from_le_bytes(raw),
                })
            }
            other => bail!("Unknown hub message tag: 0x{other:02x}"),
        }
    }
}

/// Messages the gateway sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayToHub {
    /// A batch of control commands.
    ShockerCommandList {
        /// Commands in the order the gateway sent them.
        commands: ControlCommandBatch,
    },
}

impl WireMessage for GatewayToHub {
    fn max_encoded_len(&self) -> usize {
        match self {
            Self::ShockerCommandList { commands } => 1 + 4 + commands.len() * COMMAND_SIZE,
        }
    }

    fn encode_into(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::ShockerCommandList { commands } => {
                buf[0] = tag::SHOCKER_COMMAND_LIST;
                // The size cap keeps any sendable batch far below u32::MAX.
                let count = commands.len() as u32;
                buf[1..5].copy_from_slice(&count.to_le_bytes());
                let mut offset = 5;
                for command in commands {
                    command.write(&mut buf[offset..offset + COMMAND_SIZE]);
                    offset += COMMAND_SIZE;
                }
                offset
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&kind, payload)) = bytes.split_first() else {
            bail!("Empty message");
        };
        match kind {
            tag::SHOCKER_COMMAND_LIST => {
                if payload.len() < 4 {
                    bail!("Command list too short: {} bytes", payload.len());
                }
                let (count, body) = payload.split_at(4);
                let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);
                let expected = usize::try_from(count)
                    .ok()
                    .and_then(|count| count.checked_mul(COMMAND_SIZE));
                if expected != Some(body.len()) {
                    bail!(
                        "Command list length mismatch: {count} commands, got {} bytes",
                        body.len()
                    );
                }
                let commands = body
                    .chunks_exact(COMMAND_SIZE)
                    .map(ControlCommand::read)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::ShockerCommandList { commands })
            }
            other => bail!("Unknown gateway message tag: 0x{other:02x}"),
        }
    }
}
