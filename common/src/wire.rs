//! JSON payloads exchanged with the device over the request/reply topics.

use serde::{Deserialize, Serialize};

use crate::types::DeviceStatus;

pub const MAX_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(rename = "requestId")]
    pub request_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    SetMaxTemperature,
    TurnOn,
    TurnOff,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetMaxTemperature => "setMaxTemperature",
            Self::TurnOn => "turnOn",
            Self::TurnOff => "turnOff",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PowerState;

    #[test]
    fn command_request_uses_camel_case_names() {
        let request = CommandRequest {
            request_id: 7,
            command: Command::SetMaxTemperature,
            value: Some(42.0),
        };
        let json = serde_json::to_string(&request).expect("serialize");
        assert_eq!(
            json,
            r#"{"requestId":7,"command":"setMaxTemperature","value":42.0}"#
        );

        let turn_on = CommandRequest {
            request_id: 8,
            command: Command::TurnOn,
            value: None,
        };
        let json = serde_json::to_string(&turn_on).expect("serialize");
        assert_eq!(json, r#"{"requestId":8,"command":"turnOn"}"#);
    }

    #[test]
    fn status_reply_accepts_null_fields() {
        let reply: StatusReply = serde_json::from_str(
            r#"{"requestId":3,"status":{"state":"OFF","temperature":null,"timestamp":null}}"#,
        )
        .expect("deserialize");
        assert_eq!(reply.request_id, 3);
        assert_eq!(reply.status.state, PowerState::Off);
        assert_eq!(reply.status.temperature, None);
        assert_eq!(reply.status.timestamp, None);
    }
}
