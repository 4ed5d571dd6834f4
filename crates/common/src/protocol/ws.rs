// WebSocket frame types for the conclave-ws.v1 protocol.
//
// Every frame is one JSON object in a text frame. Client and server frames
// are tagged by `op`; the hello reply is the only untagged frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorKind;

pub const CURRENT_PROTOCOL_VERSION: &str = "conclave-ws.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

/// Client -> daemon frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on every connection.
    Hello {
        session_id: String,
        #[serde(default)]
        token: String,
    },

    CallTool {
        request_id: String,
        tool: String,
        #[serde(default = "empty_params")]
        params: Value,
    },

    Cancel {
        request_id: String,
    },

    /// Application-level liveness check, answered with `pong`.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },

    ListTools {
        request_id: String,
    },
}

/// Daemon -> client frames, after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Progress {
        request_id: String,
        message: String,
    },

    Result {
        request_id: String,
        payload: Value,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<Value>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
}

/// Reply to `hello`: `{"ok":true}` or `{"ok":false,"reason":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<f64>,
}

impl HelloReply {
    pub fn accepted(server_version: impl Into<String>, tool_timeout_secs: f64) -> Self {
        Self {
            ok: true,
            reason: None,
            server_version: Some(server_version.into()),
            tool_timeout_secs: Some(tool_timeout_secs),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { ok: false, reason: Some(reason.into()), server_version: None, tool_timeout_secs: None }
    }
}

/// Anything the daemon may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Hello(HelloReply),
    Message(ServerMessage),
}

impl ServerMessage {
    pub fn error(request_id: Option<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error { request_id, kind, message: message.into(), partial: None }
    }

    /// The request this frame belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Progress { request_id, .. } | Self::Result { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
            Self::Pong { .. } => None,
        }
    }
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

pub fn decode_client_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

/// Decode a daemon frame; frames without `op` are hello replies.
pub fn decode_server_frame(raw: &str) -> Result<ServerFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("op").is_some() {
        serde_json::from_value(value).map(ServerFrame::Message)
    } else {
        serde_json::from_value(value).map(ServerFrame::Hello)
    }
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Best-effort recovery of `request_id` from a frame that failed to decode,
/// so the error can still be correlated by the caller.
pub fn request_id_hint(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("request_id")?.as_str().map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_tool_defaults_params_to_empty_object() {
        let message =
            decode_client_message(r#"{"op":"call_tool","request_id":"r1","tool":"version"}"#)
                .unwrap();
        assert_eq!(
            message,
            ClientMessage::CallTool {
                request_id: "r1".into(),
                tool: "version".into(),
                params: json!({}),
            }
        );
    }

    #[test]
    fn hello_without_token_decodes_with_empty_token() {
        let message = decode_client_message(r#"{"op":"hello","session_id":"s"}"#).unwrap();
        assert_eq!(message, ClientMessage::Hello { session_id: "s".into(), token: String::new() });
    }

    #[test]
    fn unknown_op_is_a_decode_error() {
        assert!(decode_client_message(r#"{"op":"teleport","request_id":"r"}"#).is_err());
        assert_eq!(request_id_hint(r#"{"op":"teleport","request_id":"r"}"#).as_deref(), Some("r"));
    }

    #[test]
    fn error_frame_omits_absent_fields() {
        let frame = ServerMessage::error(Some("r9".into()), ErrorKind::Timeout, "too slow");
        let encoded: Value = serde_json::from_str(&encode_message(&frame).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"op":"error","request_id":"r9","kind":"TIMEOUT","message":"too slow"})
        );
    }

    #[test]
    fn server_frames_are_told_apart_by_op() {
        assert_eq!(
            decode_server_frame(r#"{"ok":false,"reason":"bad token"}"#).unwrap(),
            ServerFrame::Hello(HelloReply::rejected("bad token"))
        );
        assert_eq!(
            decode_server_frame(r#"{"op":"pong"}"#).unwrap(),
            ServerFrame::Message(ServerMessage::Pong { nonce: None })
        );
    }

    #[test]
    fn accepted_hello_reply_serializes_ok_true() {
        let encoded: Value =
            serde_json::to_value(HelloReply::accepted("0.1.0", 120.0)).unwrap();
        assert_eq!(encoded["ok"], json!(true));
        assert!(encoded.get("reason").is_none());
    }
}
