// CallHandle: one outstanding tool invocation on a session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Accepted, waiting for a concurrency slot.
    Pending,
    Running,
    Completed,
    Cancelled,
    TimedOut,
}

impl CallStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct CallHandle {
    pub request_id: String,
    pub tool_name: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl CallHandle {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            status: CallStatus::Pending,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token the executing task watches.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = CallStatus::Cancelled;
        }
        self.cancel.cancel();
    }
}
