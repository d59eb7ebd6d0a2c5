//! `rftransmit` text protocol.
//!
//! Each command becomes one line: `rftransmit <json>\r\n`.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::protocol::{ControlCommand, ShockerCommandType, ShockerModel};

/// JSON body of an `rftransmit` line. Field order is the wire order.
#[derive(Debug, Serialize)]
struct RfTransmit {
    id: u16,
    model: ShockerModel,
    #[serde(rename = "type")]
    command_type: ShockerCommandType,
    intensity: u8,
    #[serde(rename = "durationMs")]
    duration_ms: u16,
}

impl From<&ControlCommand> for RfTransmit {
    fn from(command: &ControlCommand) -> Self {
        Self {
            id: command.shocker_id,
            model: command.model,
            command_type: command.command_type,
            intensity: command.intensity,
            duration_ms: command.duration_ms,
        }
    }
}

/// Render `command` as the bytes of one `rftransmit` line.
///
/// # Errors
///
/// Returns an error if the command cannot be serialized.
pub fn encode(command: &ControlCommand) -> Result<Vec<u8>> {
    let json = serde_json::to_string(&RfTransmit::from(command))
        .context("Failed to serialize rftransmit command")?;
    Ok(format!("rftransmit {json}\r\n").into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vibrate_command_line() {
        let command = ControlCommand {
            shocker_id: 1,
            model: ShockerModel::CaiXianlin,
            command_type: ShockerCommandType::Vibrate,
            intensity: 50,
            duration_ms: 200,
        };
        assert_eq!(
            String::from_utf8(encode(&command).unwrap()).unwrap(),
            "rftransmit {\"id\":1,\"model\":\"caixianlin\",\"type\":\"vibrate\",\"intensity\":50,\"durationMs\":200}\r\n"
        );
    }

    #[test]
    fn test_extreme_values() {
        let command = ControlCommand {
            shocker_id: u16::MAX,
            model: ShockerModel::PetTrainer,
            command_type: ShockerCommandType::Stop,
            intensity: 255,
            duration_ms: u16::MAX,
        };
        let line = String::from_utf8(encode(&command).unwrap()).unwrap();
        assert_eq!(
            line,
            "rftransmit {\"id\":65535,\"model\":\"petrainer\",\"type\":\"stop\",\"intensity\":255,\"durationMs\":65535}\r\n"
        );
    }
}
