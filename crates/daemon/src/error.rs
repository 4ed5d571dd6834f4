// Call-level failures and their wire kinds.

use std::time::Duration;

use conclave_common::ErrorKind;
use thiserror::Error;

use crate::expert::ExpertError;
use crate::provider::ProviderError;
use crate::workflow::StoreError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{layer} timeout of {limit:?} exceeded")]
    Timeout { layer: &'static str, limit: Duration },

    #[error("call was cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Expert(#[from] ExpertError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::ToolCancelled,
            Self::Provider(ProviderError::Timeout(_)) => ErrorKind::Timeout,
            Self::Provider(_) => ErrorKind::ProviderError,
            Self::Expert(error) => error.kind(),
            // Collaborator failure: reported like a backend call failure.
            Self::Store(_) => ErrorKind::ProviderError,
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_failure_source() {
        assert_eq!(CallError::UnknownTool("x".into()).kind(), ErrorKind::UnknownTool);
        assert_eq!(CallError::Cancelled.kind(), ErrorKind::ToolCancelled);
        assert_eq!(
            CallError::Timeout { layer: "tool", limit: Duration::from_secs(1) }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CallError::from(ProviderError::Request("boom".into())).kind(),
            ErrorKind::ProviderError
        );
        assert_eq!(
            CallError::from(ProviderError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CallError::from(ExpertError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn timeout_message_names_the_layer() {
        let error = CallError::Timeout { layer: "daemon", limit: Duration::from_secs(180) };
        assert_eq!(error.to_string(), "daemon timeout of 180s exceeded");
    }
}
