//! Control-plane message types

use crate::model::{AgentSnapshot, Uplink};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level control message, one per frame.
///
/// The handshake runs in the clear (`Init`, `Ack`); everything after it is an
/// `Encrypted` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Agent → Controller: opens the handshake
    #[serde(rename_all = "camelCase")]
    Init { nonce_agent: String },
    /// Controller → Agent: proves knowledge of the shared key
    #[serde(rename_all = "camelCase")]
    Ack {
        nonce_controller: String,
        mac: String,
        agent_id: String,
    },
    /// AEAD-protected event envelope (all fields base64)
    Encrypted(Envelope),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Init { .. } => "INIT",
            ControlMessage::Ack { .. } => "ACK",
            ControlMessage::Encrypted(_) => "ENCRYPTED",
        }
    }
}

/// Encrypted envelope as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Decrypted envelope body before typed dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

pub const EVENT_REGISTER: &str = "REGISTER";
pub const EVENT_STATUS_UPDATE: &str = "STATUS_UPDATE";
pub const EVENT_COMMAND: &str = "COMMAND";
pub const EVENT_LOG: &str = "LOG";

/// Typed control event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Full agent snapshot (uplinks + health)
    Register(AgentSnapshot),
    /// Incremental uplink state
    StatusUpdate(StatusUpdate),
    /// Structured log line from the agent
    Log(LogPayload),
    /// Controller → Agent only
    Command(Command),
    /// Event type this build does not know; logged and dropped by the session
    Unknown { event: String },
}

impl Event {
    pub fn event_type(&self) -> &str {
        match self {
            Event::Register(_) => EVENT_REGISTER,
            Event::StatusUpdate(_) => EVENT_STATUS_UPDATE,
            Event::Log(_) => EVENT_LOG,
            Event::Command(_) => EVENT_COMMAND,
            Event::Unknown { event } => event,
        }
    }

    /// Decode a typed event from a decrypted envelope
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self, serde_json::Error> {
        let event = match envelope.event.as_str() {
            EVENT_REGISTER => Event::Register(serde_json::from_value(envelope.payload)?),
            EVENT_STATUS_UPDATE => Event::StatusUpdate(serde_json::from_value(envelope.payload)?),
            EVENT_LOG => Event::Log(serde_json::from_value(envelope.payload)?),
            EVENT_COMMAND => Event::Command(serde_json::from_value(envelope.payload)?),
            _ => Event::Unknown {
                event: envelope.event,
            },
        };
        Ok(event)
    }

    /// Encode this event into an envelope body
    pub fn to_envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        let payload = match self {
            Event::Register(snapshot) => serde_json::to_value(snapshot)?,
            Event::StatusUpdate(update) => serde_json::to_value(update)?,
            Event::Log(log) => serde_json::to_value(log)?,
            Event::Command(command) => serde_json::to_value(command)?,
            Event::Unknown { .. } => Value::Null,
        };
        Ok(EventEnvelope {
            event: self.event_type().to_string(),
            payload,
        })
    }
}

/// Incremental state report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub id: String,
    pub uplinks: Vec<Uplink>,
}

/// Structured log line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogPayload {
    pub level: String,
    pub msg: String,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Command operations understood by agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Start,
    Stop,
    Reboot,
    Rotate,
    /// Passed through to the uplink driver unopened
    Unlock,
    /// Passed through to the uplink driver unopened
    UpdateAuth,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Start => "START",
            Operation::Stop => "STOP",
            Operation::Reboot => "REBOOT",
            Operation::Rotate => "ROTATE",
            Operation::Unlock => "UNLOCK",
            Operation::UpdateAuth => "UPDATE_AUTH",
            Operation::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Controller → Agent command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub operation: Operation,
    pub target_uplink_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Command {
    pub fn new(operation: Operation, target_uplink_id: impl Into<String>) -> Self {
        Self {
            operation,
            target_uplink_id: target_uplink_id.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_wire_shape() {
        let msg = ControlMessage::Init {
            nonce_agent: "00ff".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "INIT", "nonceAgent": "00ff"}));
    }

    #[test]
    fn test_ack_wire_shape() {
        let raw = json!({
            "type": "ACK",
            "nonceController": "aa",
            "mac": "bb",
            "agentId": "worker_1"
        });
        let msg: ControlMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Ack {
                nonce_controller: "aa".to_string(),
                mac: "bb".to_string(),
                agent_id: "worker_1".to_string(),
            }
        );
    }

    #[test]
    fn test_encrypted_wire_shape() {
        let raw = json!({"type": "ENCRYPTED", "iv": "a", "ciphertext": "b", "tag": "c"});
        let msg: ControlMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.kind(), "ENCRYPTED");
    }

    #[test]
    fn test_command_decoding() {
        let envelope = EventEnvelope {
            event: "COMMAND".to_string(),
            payload: json!({
                "operation": "UPDATE_AUTH",
                "targetUplinkId": "modem_1",
                "parameters": {"user": "u", "pass": "p"}
            }),
        };

        match Event::from_envelope(envelope).unwrap() {
            Event::Command(cmd) => {
                assert_eq!(cmd.operation, Operation::UpdateAuth);
                assert_eq!(cmd.target_uplink_id, "modem_1");
                assert_eq!(cmd.parameters.unwrap()["user"], "u");
            }
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_operation_decodes() {
        let cmd: Command = serde_json::from_value(json!({
            "operation": "SELF_DESTRUCT",
            "targetUplinkId": "modem_1"
        }))
        .unwrap();
        assert_eq!(cmd.operation, Operation::Unknown);
    }

    #[test]
    fn test_unknown_event_type() {
        let envelope = EventEnvelope {
            event: "HEARTBEAT".to_string(),
            payload: Value::Null,
        };
        let event = Event::from_envelope(envelope).unwrap();
        assert_eq!(
            event,
            Event::Unknown {
                event: "HEARTBEAT".to_string()
            }
        );
    }

    #[test]
    fn test_log_envelope() {
        let event = Event::Log(LogPayload {
            level: "WARN".to_string(),
            msg: "signal low".to_string(),
            timestamp: Some(1_700_000_000_000),
        });
        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.event, "LOG");
        assert_eq!(envelope.payload["msg"], "signal low");
        assert_eq!(Event::from_envelope(envelope).unwrap(), event);
    }

    #[test]
    fn test_malformed_payload_is_error() {
        let envelope = EventEnvelope {
            event: "STATUS_UPDATE".to_string(),
            payload: json!({"id": 5}),
        };
        assert!(Event::from_envelope(envelope).is_err());
    }
}
