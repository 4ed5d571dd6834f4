// Error kinds shared by the daemon, the shim and the wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every `kind` string that can appear in an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthRejected,
    ConfigInvalid,
    MalformedMessage,
    Timeout,
    ToolCancelled,
    ProviderError,
    /// Informational: the call was served by an identical in-flight call.
    DuplicateCallMerged,
    UnknownTool,
    InvalidParams,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRejected => "AUTH_REJECTED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::Timeout => "TIMEOUT",
            Self::ToolCancelled => "TOOL_CANCELLED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::DuplicateCallMerged => "DUPLICATE_CALL_MERGED",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::InvalidParams => "INVALID_PARAMS",
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthRejected => "missing or invalid token",
            Self::ConfigInvalid => "configuration is invalid",
            Self::MalformedMessage => "frame is not a valid protocol message",
            Self::Timeout => "call exceeded its timeout",
            Self::ToolCancelled => "call was cancelled",
            Self::ProviderError => "model provider call failed",
            Self::DuplicateCallMerged => "served by an identical in-flight call",
            Self::UnknownTool => "tool is not registered",
            Self::InvalidParams => "tool parameters are invalid",
        }
    }

    /// Only a rejected handshake ends the connection; every other kind is
    /// reported to the peer while the socket stays open.
    pub const fn is_terminal_for_connection(self) -> bool {
        matches!(self, Self::AuthRejected)
    }

    /// Informational kinds are never delivered as a call's final outcome.
    pub const fn is_informational(self) -> bool {
        matches!(self, Self::DuplicateCallMerged)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn serializes_as_wire_kind_strings() {
        for kind in [
            ErrorKind::AuthRejected,
            ErrorKind::ConfigInvalid,
            ErrorKind::MalformedMessage,
            ErrorKind::Timeout,
            ErrorKind::ToolCancelled,
            ErrorKind::ProviderError,
            ErrorKind::DuplicateCallMerged,
            ErrorKind::UnknownTool,
            ErrorKind::InvalidParams,
        ] {
            let encoded = serde_json::to_string(&kind).unwrap();
            assert_eq!(encoded, format!("\"{}\"", kind.as_str()));
            let decoded: ErrorKind = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, kind);
        }
    }

    #[test]
    fn only_auth_rejection_closes_the_connection() {
        assert!(ErrorKind::AuthRejected.is_terminal_for_connection());
        assert!(!ErrorKind::MalformedMessage.is_terminal_for_connection());
        assert!(!ErrorKind::Timeout.is_terminal_for_connection());
    }
}
