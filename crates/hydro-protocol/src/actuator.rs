//! Node actuator HTTP API bodies.
//!
//! Every endpoint answers `{"status": "success" | "failure", "error"?: ...}`
//! with endpoint-specific extras (`relay_status`, `state`).

use hydro_core::RelayState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Failure,
}

/// Body returned by valve relay, feed pump and settings endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Valve relay status endpoint payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_status: Option<Value>,
    /// Feed pump status endpoint payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl ActuatorReply {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Error text for a failure reply.
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "node reported failure".to_string())
    }

    /// Relay state carried by a status reply, whichever field holds it.
    pub fn reported_state(&self) -> RelayState {
        let value = self.relay_status.as_ref().or(self.state.as_ref());
        match value {
            Some(Value::String(s)) => RelayState::parse(s),
            Some(Value::Bool(b)) => {
                if *b {
                    RelayState::On
                } else {
                    RelayState::Off
                }
            }
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => RelayState::Off,
                Some(_) => RelayState::On,
                None => RelayState::Unknown,
            },
            _ => RelayState::Unknown,
        }
    }
}

/// Body of `POST /settings/feeding_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedingStatusRequest {
    pub in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reply() {
        let reply: ActuatorReply =
            serde_json::from_str(r#"{"status":"failure","error":"relay busy"}"#).unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.failure_reason(), "relay busy");
    }

    #[test]
    fn test_status_reply_variants() {
        let reply: ActuatorReply =
            serde_json::from_str(r#"{"status":"success","relay_id":3,"relay_status":"on"}"#)
                .unwrap();
        assert_eq!(reply.reported_state(), RelayState::On);

        let reply: ActuatorReply =
            serde_json::from_str(r#"{"status":"success","state":0}"#).unwrap();
        assert_eq!(reply.reported_state(), RelayState::Off);

        let reply: ActuatorReply = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(reply.reported_state(), RelayState::Unknown);
    }

    #[test]
    fn test_feeding_status_body() {
        let body = serde_json::to_string(&FeedingStatusRequest { in_progress: true }).unwrap();
        assert_eq!(body, r#"{"in_progress":true}"#);
    }
}
