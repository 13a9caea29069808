//! JSON messages exchanged over the WebSocket.
//!
//! Inbound commands are tagged by `command`, outbound messages by `type`.

use serde::{Deserialize, Serialize};
use tts_core::Device;

use crate::{error::SessionError, telemetry::GpuInfo};

/// Command names the server understands
pub const COMMANDS: [&str; 6] = [
    "synthesize",
    "list_voices",
    "set_voice",
    "set_temperature",
    "set_cfg_coef",
    "status",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Synthesize {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
        #[serde(default)]
        voice: Option<String>,
    },
    ListVoices,
    /// A missing field re-applies the current value
    SetVoice {
        #[serde(default)]
        voice: Option<String>,
    },
    SetTemperature {
        #[serde(default)]
        temperature: Option<f64>,
    },
    SetCfgCoef {
        #[serde(default)]
        cfg_coef: Option<f64>,
    },
    Status,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Synthesize { .. } => "synthesize",
            ClientCommand::ListVoices => "list_voices",
            ClientCommand::SetVoice { .. } => "set_voice",
            ClientCommand::SetTemperature { .. } => "set_temperature",
            ClientCommand::SetCfgCoef { .. } => "set_cfg_coef",
            ClientCommand::Status => "status",
        }
    }

    /// Commands that may be answered while a job is streaming
    pub fn is_read_only(&self) -> bool {
        matches!(self, ClientCommand::ListVoices | ClientCommand::Status)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Parse one inbound text message
pub fn parse_command(text: &str) -> Result<ClientCommand, SessionError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| SessionError::Protocol("Invalid JSON message".to_string()))?;

    let name = match value.get("command") {
        Some(serde_json::Value::String(name)) => name.clone(),
        Some(other) => return Err(SessionError::Protocol(format!("Unknown command: {other}"))),
        None => return Err(SessionError::Protocol("Unknown command: null".to_string())),
    };
    if !COMMANDS.contains(&name.as_str()) {
        return Err(SessionError::Protocol(format!("Unknown command: {name}")));
    }

    serde_json::from_value(value).map_err(|e| SessionError::Protocol(format!("Invalid {name} command: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SynthesisStarted {
        text: String,
        voice: String,
    },
    AudioChunk {
        /// Base64 of 16-bit little-endian mono PCM
        chunk: String,
        index: usize,
        /// Set on the last chunk of a job only
        total: Option<usize>,
        sample_rate: u32,
    },
    SynthesisCompleted {
        total_chunks: usize,
    },
    Voices {
        voices: Vec<String>,
        current: String,
    },
    VoiceChanged {
        voice: String,
    },
    TemperatureChanged {
        temperature: f64,
    },
    CfgCoefChanged {
        cfg_coef: f64,
    },
    Status {
        initialized: bool,
        device: Device,
        current_voice: String,
        sample_rate: u32,
        temperature: f64,
        cfg_coef: f64,
        gpu_info: GpuInfo,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn protocol_message(text: &str) -> String {
        match parse_command(text) {
            Err(SessionError::Protocol(msg)) => msg,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command(r#"{"command":"synthesize","text":"Hi","voice":"alba"}"#).unwrap(),
            ClientCommand::Synthesize {
                text: "Hi".into(),
                voice: Some("alba".into())
            }
        );
        assert_eq!(
            parse_command(r#"{"command":"set_temperature","temperature":1}"#).unwrap(),
            ClientCommand::SetTemperature { temperature: Some(1.0) }
        );
        assert_eq!(
            parse_command(r#"{"command":"set_cfg_coef"}"#).unwrap(),
            ClientCommand::SetCfgCoef { cfg_coef: None }
        );
        assert_eq!(
            parse_command(r#"{"command":"status","extra":true}"#).unwrap(),
            ClientCommand::Status
        );
    }

    #[test]
    fn test_missing_text_parses_as_empty() {
        for raw in [r#"{"command":"synthesize"}"#, r#"{"command":"synthesize","text":null}"#] {
            assert_eq!(
                parse_command(raw).unwrap(),
                ClientCommand::Synthesize {
                    text: String::new(),
                    voice: None
                }
            );
        }
    }

    #[test]
    fn test_protocol_errors() {
        assert_eq!(protocol_message("not json"), "Invalid JSON message");
        assert_eq!(protocol_message(r#"{"command":"dance"}"#), "Unknown command: dance");
        assert_eq!(protocol_message(r#"{"text":"hi"}"#), "Unknown command: null");
        assert_eq!(protocol_message(r#"{"command":7}"#), "Unknown command: 7");
        assert!(protocol_message(r#"{"command":"set_temperature","temperature":"hot"}"#)
            .starts_with("Invalid set_temperature command"));
    }

    #[test]
    fn test_audio_chunk_wire_shape() {
        let msg = ServerMessage::AudioChunk {
            chunk: "AAA=".into(),
            index: 0,
            total: None,
            sample_rate: 24_000,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "audio_chunk", "chunk": "AAA=", "index": 0, "total": null, "sample_rate": 24000})
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let msg = ServerMessage::Error {
            message: "Invalid JSON message".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "message": "Invalid JSON message"})
        );
    }
}
