//! Command types and wire format

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ISSUED_AT: &str = "issued-at";

/// Fleet-management instruction addressed to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Stop taking new tasks
    Freeze,
    /// Resume taking tasks
    Unfreeze,
    /// Give up some held tasks so other nodes can take them
    Balance,
    /// Give up one task
    StopTask { task: String },
    /// Shut the node down
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Freeze => write!(f, "freeze"),
            Command::Unfreeze => write!(f, "unfreeze"),
            Command::Balance => write!(f, "balance"),
            Command::StopTask { task } => write!(f, "stop-task({})", task),
            Command::Stop => write!(f, "stop"),
        }
    }
}

/// A command as stored in a node's inbox
///
/// Encoded as a flat JSON object, e.g.
/// `{"command":"stop-task","task":"t1","issued-at":"2025-01-01T00:00:00Z"}`.
/// The timestamp is optional and lets callers tell repeated commands apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub command: Command,
    pub issued_at: Option<DateTime<Utc>>,
}

impl CommandMessage {
    /// Wrap a command stamped with the current time
    pub fn new(command: Command) -> Self {
        Self {
            command,
            issued_at: Some(Utc::now()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(&self.command)?;
        if let (Value::Object(map), Some(at)) = (&mut value, self.issued_at) {
            map.insert(ISSUED_AT.to_string(), serde_json::to_value(at)?);
        }
        serde_json::to_string(&value)
    }

    /// Parse a stored command
    ///
    /// A bare command name such as `freeze` is accepted as shorthand.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        let trimmed = raw.trim();
        let mut value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) if is_bare_word(trimmed) => {
                tracing::debug!(error = %e, "CommandMessage::decode: treating payload as a bare command name");
                serde_json::json!({ "command": trimmed })
            }
            Err(e) => return Err(e),
        };

        let issued_at = match &mut value {
            Value::Object(map) => match map.remove(ISSUED_AT) {
                Some(Value::Null) | None => None,
                Some(at) => Some(serde_json::from_value(at)?),
            },
            _ => None,
        };
        let command = serde_json::from_value(value)?;
        Ok(Self { command, issued_at })
    }
}

fn is_bare_word(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode_wire_format() {
        let msg = CommandMessage {
            command: Command::StopTask {
                task: "t1".to_string(),
            },
            issued_at: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["command"], "stop-task");
        assert_eq!(value["task"], "t1");
        assert_eq!(value["issued-at"], "2025-01-02T03:04:05Z");

        assert_eq!(CommandMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_encode_without_timestamp() {
        let msg = CommandMessage {
            command: Command::Freeze,
            issued_at: None,
        };
        assert_eq!(msg.encode().unwrap(), r#"{"command":"freeze"}"#);
    }

    #[test]
    fn test_decode_variants() {
        let msg = CommandMessage::decode(r#"{"command":"balance"}"#).unwrap();
        assert_eq!(msg.command, Command::Balance);
        assert!(msg.issued_at.is_none());

        let msg = CommandMessage::decode(r#"{"command":"stop","issued-at":"2025-06-01T12:00:00Z"}"#).unwrap();
        assert_eq!(msg.command, Command::Stop);
        assert!(msg.issued_at.is_some());
    }

    #[test]
    fn test_decode_bare_word() {
        assert_eq!(CommandMessage::decode("unfreeze\n").unwrap().command, Command::Unfreeze);
        assert_eq!(CommandMessage::decode("freeze").unwrap().command, Command::Freeze);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CommandMessage::decode("").is_err());
        assert!(CommandMessage::decode("explode").is_err());
        assert!(CommandMessage::decode(r#"{"command":"stop-task"}"#).is_err());
        assert!(CommandMessage::decode("{not json").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::StopTask { task: "t9".into() }.to_string(), "stop-task(t9)");
        assert_eq!(Command::Stop.to_string(), "stop");
    }
}
