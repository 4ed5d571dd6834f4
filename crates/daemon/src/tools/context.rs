// Per-call context handed to tool handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conclave_common::protocol::ws::ServerMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Throttled progress channel for one call. The first report always goes
/// out; later ones are dropped when they arrive within `min_interval` of
/// the last one sent.
#[derive(Clone)]
pub struct ProgressSink {
    request_id: Arc<str>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    min_interval: Duration,
    last_sent: Arc<Mutex<Option<Instant>>>,
}

impl ProgressSink {
    pub fn new(
        request_id: impl Into<Arc<str>>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        min_interval: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            outbound,
            min_interval,
            last_sent: Arc::new(Mutex::new(None)),
        }
    }

    /// A sink plus the receiving end, for callers without a socket.
    pub fn channel(
        request_id: impl Into<Arc<str>>,
        min_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(request_id, sender, min_interval), receiver)
    }

    /// Returns true if the message was forwarded.
    pub fn report(&self, message: impl Into<String>) -> bool {
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(previous) = *last_sent {
                if now.duration_since(previous) < self.min_interval {
                    return false;
                }
            }
            *last_sent = Some(now);
        }
        self.outbound
            .send(ServerMessage::Progress {
                request_id: self.request_id.to_string(),
                message: message.into(),
            })
            .is_ok()
    }
}

/// The latest partial result a call has published. Read when the call ends
/// without a payload (timeout, cancellation) so accumulated work is still
/// returned.
#[derive(Clone, Default)]
pub struct PartialSlot(Arc<Mutex<Option<Value>>>);

impl PartialSlot {
    pub fn publish(&self, partial: Value) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Some(partial);
    }

    pub fn snapshot(&self) -> Option<Value> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[derive(Clone)]
pub struct CallContext {
    pub session_id: String,
    pub request_id: String,
    pub progress: ProgressSink,
    pub partial: PartialSlot,
}

impl CallContext {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            progress,
            partial: PartialSlot::default(),
        }
    }
}
