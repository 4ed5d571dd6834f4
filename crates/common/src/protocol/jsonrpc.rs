// JSON-RPC 2.0 types for the shim's local newline-delimited stdio protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_PING: &str = "ping";
pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

/// A JSON-RPC 2.0 notification (no `id`, no response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: RequestId,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID: integer, string, or null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
            Self::Null => f.write_str("null"),
        }
    }
}

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Server-defined codes for daemon error kinds.
pub const TIMEOUT: i32 = -32001;
pub const TOOL_CANCELLED: i32 = -32002;
pub const PROVIDER_ERROR: i32 = -32003;
pub const UNKNOWN_TOOL: i32 = -32004;
pub const AUTH_REJECTED: i32 = -32005;

/// JSON-RPC code used when a daemon error kind is relayed to a local caller.
pub const fn code_for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::AuthRejected => AUTH_REJECTED,
        ErrorKind::ConfigInvalid => INTERNAL_ERROR,
        ErrorKind::MalformedMessage => INVALID_REQUEST,
        ErrorKind::Timeout => TIMEOUT,
        ErrorKind::ToolCancelled => TOOL_CANCELLED,
        ErrorKind::ProviderError => PROVIDER_ERROR,
        ErrorKind::DuplicateCallMerged => INTERNAL_ERROR,
        ErrorKind::UnknownTool => UNKNOWN_TOOL,
        ErrorKind::InvalidParams => INVALID_PARAMS,
    }
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self { jsonrpc: "2.0".to_string(), method: method.into(), params, id }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: "2.0".to_string(), method: method.into(), params }
    }
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), result: Some(result), error: None, id }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self { jsonrpc: "2.0".to_string(), result: None, error: Some(error), id }
    }
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
