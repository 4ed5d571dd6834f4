// Execution of one accepted `call_tool`, from slot acquisition to the final
// frame.

use std::sync::Arc;

use conclave_common::protocol::ws::ServerMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::CallError;
use crate::session::{CallStatus, SessionKey};
use crate::tools::{CallContext, ProgressSink, ToolHandler};

/// Run `handler` under the daemon's limits and send exactly one terminal
/// frame (`result` or `error`) for `request_id`.
///
/// The whole call, including the wait for a concurrency slot, is bounded by
/// `daemon_timeout`; the handler itself by `tool_timeout`. Cancellation wins
/// over both. Timeouts and cancellations carry the call's last partial.
pub async fn run_call(
    state: Arc<AppState>,
    key: SessionKey,
    request_id: String,
    handler: Arc<dyn ToolHandler>,
    params: Value,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) {
    let tool = handler.descriptor().name;
    let progress = ProgressSink::new(
        request_id.as_str(),
        outbound.clone(),
        state.config.progress_min_interval(),
    );
    let ctx = CallContext::new(key.session_id.as_str(), request_id.as_str(), progress);
    let partial = ctx.partial.clone();
    let daemon_timeout = state.timeouts.daemon_timeout();
    let started_at = Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        result = tokio::time::timeout(
            daemon_timeout,
            execute(&state, &key, &request_id, handler, params, ctx),
        ) => match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Timeout { layer: "daemon", limit: daemon_timeout }),
        },
    };

    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    let (frame, status) = match outcome {
        Ok(payload) => {
            info!(session_id = %key.session_id, request_id = %request_id, tool = %tool, elapsed_ms, "call completed");
            (ServerMessage::Result { request_id: request_id.clone(), payload }, CallStatus::Completed)
        }
        Err(error) => {
            let status = match &error {
                CallError::Cancelled => CallStatus::Cancelled,
                CallError::Timeout { .. } => CallStatus::TimedOut,
                _ => CallStatus::Completed,
            };
            warn!(
                session_id = %key.session_id,
                request_id = %request_id,
                tool = %tool,
                elapsed_ms,
                kind = %error.kind(),
                %error,
                "call failed"
            );
            let frame = ServerMessage::Error {
                request_id: Some(request_id.clone()),
                kind: error.kind(),
                message: error.to_string(),
                partial: partial.snapshot(),
            };
            (frame, status)
        }
    };

    // Free the request_id before the caller can see the outcome and reuse it.
    state.registry.finish_call(&key, &request_id, status);
    if outbound.send(frame).is_err() {
        debug!(session_id = %key.session_id, request_id = %request_id, "socket gone before the outcome was sent");
    }
}

async fn execute(
    state: &AppState,
    key: &SessionKey,
    request_id: &str,
    handler: Arc<dyn ToolHandler>,
    params: Value,
    ctx: CallContext,
) -> Result<Value, CallError> {
    let _permit = state
        .limiter
        .acquire(&key.session_id)
        .await
        .map_err(|_| CallError::Cancelled)?;
    state.registry.mark_running(key, request_id);

    let tool_timeout = state.timeouts.tool_timeout();
    match tokio::time::timeout(tool_timeout, handler.call(params, ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(CallError::Timeout { layer: "tool", limit: tool_timeout }),
    }
}
