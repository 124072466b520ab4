use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Response of a client to a reverse request (`runInTerminal`, `startDebugging`).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientResponse {
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Message received from a client.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Request(DapRequest),
    Response(ClientResponse),
}

impl ClientMessage {
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match msg_type {
            "request" => Ok(ClientMessage::Request(serde_json::from_value(value)?)),
            "response" => Ok(ClientMessage::Response(serde_json::from_value(value)?)),
            other => Err(anyhow::anyhow!("unexpected DAP message type: {other:?}")),
        }
    }
}

/// DAP response envelope, `body` is omitted when empty.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Request sent by the adapter to a client.
#[derive(Debug, Serialize)]
pub struct DapReverseRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: &'static str,
    pub arguments: Value,
}
