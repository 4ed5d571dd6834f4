// Per-socket protocol loop: hello handshake, heartbeat, dispatch.

use std::future::pending;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use conclave_common::protocol::ws::{
    decode_client_message, encode_message, request_id_hint, ClientMessage, HelloReply,
    ServerMessage,
};
use conclave_common::ErrorKind;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use super::{run_call, AppState};
use crate::session::{BeginCallError, SessionKey};

enum HelloOutcome {
    Hello { session_id: String, token: String },
    Invalid(String),
    Closed,
}

pub(super) async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    let (session_id, token) =
        match tokio::time::timeout(state.config.hello_timeout(), read_hello(&mut socket)).await {
            Ok(HelloOutcome::Hello { session_id, token }) => (session_id, token),
            Ok(HelloOutcome::Invalid(reason)) => {
                warn!(kind = %ErrorKind::MalformedMessage, %reason, "handshake rejected");
                reject(&mut socket, reason).await;
                return;
            }
            Ok(HelloOutcome::Closed) => return,
            Err(_) => {
                warn!(timeout = ?state.config.hello_timeout(), "no hello before timeout, closing");
                reject(&mut socket, "hello timeout".to_string()).await;
                return;
            }
        };

    if session_id.is_empty() {
        reject(&mut socket, "session_id is required".to_string()).await;
        return;
    }
    if !state.config.accepts_token(&token) {
        warn!(kind = %ErrorKind::AuthRejected, session_id = %session_id, "handshake rejected: invalid token");
        reject(&mut socket, "invalid token".to_string()).await;
        return;
    }

    let registration = state.registry.register(&session_id, &token);
    let key = registration.key.clone();
    let hello = HelloReply::accepted(
        env!("CARGO_PKG_VERSION"),
        state.timeouts.tool_timeout().as_secs_f64(),
    );
    if send_frame(&mut socket, &hello).await.is_err() {
        state.registry.remove(&key);
        return;
    }
    info!(
        session_id = %key.session_id,
        connection_id = key.connection_id,
        superseded = registration.superseded,
        "session established"
    );

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();

    let ping_interval = state.config.ping_interval();
    let ping_timeout = state.config.ping_timeout();
    let idle_timeout = state.config.session_idle_timeout();
    let mut heartbeat = tokio::time::interval(ping_interval);
    heartbeat.reset(); // skip immediate first tick
    let mut pong_deadline: Option<Instant> = None;

    let close_reason = loop {
        tokio::select! {
            _ = registration.shutdown.cancelled() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "session closed by daemon".into(),
                    })))
                    .await;
                break "shutdown or superseded";
            }
            _ = until(pong_deadline) => {
                warn!(session_id = %key.session_id, "heartbeat timeout, disconnecting");
                break "heartbeat timeout";
            }
            _ = heartbeat.tick() => {
                if state.registry.is_idle(&key, idle_timeout) {
                    info!(session_id = %key.session_id, "idle session evicted");
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "idle timeout".into(),
                        })))
                        .await;
                    break "idle";
                }
                if pong_deadline.is_none() {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break "send failed";
                    }
                    pong_deadline = Some(Instant::now() + ping_timeout);
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                // The loop holds a sender, so this never yields None.
                let Some(outbound) = maybe_outbound else { continue };
                if send_frame(&mut socket, &outbound).await.is_err() {
                    break "send failed";
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break "peer closed";
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        state.registry.touch(&key);
                        if let Some(reply) = dispatch(&state, &key, raw.as_str(), &outbound_sender) {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                break "send failed";
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        let reply = ServerMessage::error(
                            None,
                            ErrorKind::MalformedMessage,
                            "binary frames are not supported",
                        );
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break "send failed";
                        }
                    }
                    Ok(Message::Pong(_)) => pong_deadline = None,
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(_)) => break "peer closed",
                    Err(error) if is_frame_size_violation(&error) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::SIZE,
                                reason: format!(
                                    "frame exceeds maximum size of {} bytes",
                                    state.config.max_frame_bytes
                                )
                                .into(),
                            })))
                            .await;
                        break "frame too large";
                    }
                    Err(error) => {
                        debug!(session_id = %key.session_id, %error, "socket error");
                        break "socket error";
                    }
                }
            }
        }
    };

    if let Some(cancelled) = state.registry.remove(&key) {
        state.limiter.forget_session(&key.session_id);
        info!(session_id = %key.session_id, cancelled, reason = close_reason, "session closed");
    } else {
        debug!(session_id = %key.session_id, reason = close_reason, "superseded connection closed");
    }
}

/// Read frames until the first protocol frame. Control frames are skipped.
async fn read_hello(socket: &mut WebSocket) -> HelloOutcome {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(raw))) => {
                return match decode_client_message(raw.as_str()) {
                    Ok(ClientMessage::Hello { session_id, token }) => {
                        HelloOutcome::Hello { session_id, token }
                    }
                    Ok(_) => HelloOutcome::Invalid("first frame must be hello".to_string()),
                    Err(error) => HelloOutcome::Invalid(format!("malformed hello: {error}")),
                };
            }
            Some(Ok(Message::Binary(_))) => {
                return HelloOutcome::Invalid("first frame must be a text hello".to_string());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return HelloOutcome::Closed,
        }
    }
}

/// Handle one decoded text frame. Returns the immediate reply, if any; call
/// outcomes arrive later through `outbound`.
fn dispatch(
    state: &Arc<AppState>,
    key: &SessionKey,
    raw: &str,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<ServerMessage> {
    let message = match decode_client_message(raw) {
        Ok(message) => message,
        Err(error) => {
            return Some(ServerMessage::error(
                request_id_hint(raw),
                ErrorKind::MalformedMessage,
                format!("invalid frame: {error}"),
            ));
        }
    };

    match message {
        ClientMessage::Hello { .. } => Some(ServerMessage::error(
            None,
            ErrorKind::MalformedMessage,
            "hello already completed on this connection",
        )),
        ClientMessage::CallTool { request_id, tool, params } => {
            let Some(handler) = state.tools.resolve(&tool) else {
                return Some(ServerMessage::error(
                    Some(request_id),
                    ErrorKind::UnknownTool,
                    format!("unknown tool `{tool}`"),
                ));
            };
            match state.registry.begin_call(key, &request_id, &tool) {
                Ok(cancel) => {
                    debug!(session_id = %key.session_id, request_id = %request_id, tool = %tool, "call accepted");
                    tokio::spawn(run_call(
                        Arc::clone(state),
                        key.clone(),
                        request_id,
                        handler,
                        params,
                        cancel,
                        outbound.clone(),
                    ));
                    None
                }
                Err(error @ BeginCallError::DuplicateRequest(_)) => Some(ServerMessage::error(
                    Some(request_id),
                    ErrorKind::MalformedMessage,
                    error.to_string(),
                )),
                Err(error @ BeginCallError::UnknownSession(_)) => Some(ServerMessage::error(
                    Some(request_id),
                    ErrorKind::ToolCancelled,
                    error.to_string(),
                )),
            }
        }
        ClientMessage::Cancel { request_id } => {
            if state.registry.cancel_call(key, &request_id) {
                info!(session_id = %key.session_id, request_id = %request_id, "call cancelled by client");
            } else {
                debug!(session_id = %key.session_id, request_id = %request_id, "cancel for unknown request ignored");
            }
            None
        }
        ClientMessage::Ping { nonce } => Some(ServerMessage::Pong { nonce }),
        ClientMessage::ListTools { request_id } => Some(ServerMessage::Result {
            request_id,
            payload: json!({ "tools": state.tools.descriptors() }),
        }),
    }
}

async fn reject(socket: &mut WebSocket, reason: String) {
    let _ = send_frame(socket, &HelloReply::rejected(reason)).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame<T: Serialize>(socket: &mut WebSocket, frame: &T) -> Result<(), ()> {
    let encoded = encode_message(frame).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        if let Some(tungstenite::Error::Capacity(_)) = current.downcast_ref::<tungstenite::Error>() {
            return true;
        }
        source = current.source();
    }
    // axum 0.8 boxes its own tungstenite's error; when that version differs
    // from ours the downcast misses, so match tungstenite's CapacityError text.
    let message = error.to_string().to_ascii_lowercase();
    message.contains("space limit exceeded") || message.contains("message too long")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tungstenite::error::CapacityError;

    #[test]
    fn capacity_errors_are_frame_size_violations() {
        let oversize = axum::Error::new(tungstenite::Error::Capacity(
            CapacityError::MessageTooLong { size: 4096, max_size: 1024 },
        ));
        assert!(is_frame_size_violation(&oversize));

        let closed = axum::Error::new(tungstenite::Error::ConnectionClosed);
        assert!(!is_frame_size_violation(&closed));
    }

    #[test]
    fn capacity_wording_is_recognised_without_the_typed_error() {
        let foreign = axum::Error::new(std::io::Error::other(
            "Space limit exceeded: Message too long: 4096 > 1024",
        ));
        assert!(is_frame_size_violation(&foreign));

        let reset = axum::Error::new(std::io::Error::other("connection reset by peer"));
        assert!(!is_frame_size_violation(&reset));
    }
}
