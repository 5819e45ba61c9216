//! Node status stream messages.
//!
//! The stream is newline-delimited JSON over a persistent TCP connection.
//! Nodes push full snapshots; the controller pushes feeding commands.

use crate::error::ProtocolError;
use crate::parse::RawNodeStatus;
use serde::{Deserialize, Serialize};

/// Upper bound for a single inbound line.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Messages received from a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// Full state snapshot.
    Status {
        #[serde(flatten)]
        status: RawNodeStatus,
    },

    /// Node acknowledged a command.
    Ack { command: String },

    /// Node reported an error.
    Error { message: String },
}

impl NodeMessage {
    /// Parses one line from the stream.
    ///
    /// # Errors
    ///
    /// `ProtocolError::TooLarge` above `MAX_MESSAGE_SIZE`, otherwise any JSON
    /// decoding error.
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Commands sent to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeCommand {
    StartFeeding,
    StopFeeding,
}

impl NodeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartFeeding => "start_feeding",
            Self::StopFeeding => "stop_feeding",
        }
    }

    /// Serializes as one stream line, newline included.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        let line = r#"{"type":"status","water_level":{"sensor1":{"label":"Full","triggered":true}},"settings":{"allow_remote_feeding":true}}"#;
        match NodeMessage::parse_line(line).unwrap() {
            NodeMessage::Status { status } => {
                let patch = status.to_patch();
                assert!(patch.water_level.is_some());
                assert!(patch.settings.unwrap().allow_remote_feeding);
                assert!(patch.valve_info.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            NodeMessage::parse_line("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(NodeMessage::parse_line(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized() {
        let line = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            NodeMessage::parse_line(&line),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_command_line_format() {
        assert_eq!(
            NodeCommand::StopFeeding.to_line().unwrap(),
            "{\"type\":\"stop_feeding\"}\n"
        );
        assert_eq!(NodeCommand::StartFeeding.as_str(), "start_feeding");
    }
}
