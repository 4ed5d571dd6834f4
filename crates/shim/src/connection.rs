// The reconnecting connection to the daemon.
//
// A single actor task owns the transport and every unanswered call. Callers
// talk to it through `ShimClient`. Connection failures never reach callers:
// the actor backs off, reconnects, and re-issues whatever is still pending.

use std::collections::HashMap;
use std::time::Duration;

use conclave_common::protocol::ws::{
    decode_server_frame, encode_message, ClientMessage, HelloReply, ServerFrame, ServerMessage,
};
use conclave_common::ErrorKind;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::transport::{DaemonTransport, TransportError};

/// What the actor needs to (re)establish a session.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub session_id: String,
    pub token: String,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("hello rejected: {0}")]
    Rejected(String),

    #[error("unexpected frame during handshake: {0}")]
    Protocol(String),

    #[error("connection closed during handshake")]
    Closed,

    #[error("handshake did not complete within {0:?}")]
    TimedOut(Duration),
}

/// A call-level failure reported to the local caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub partial: Option<Value>,
}

impl CallFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), partial: None }
    }
}

/// Events delivered to the caller that owns a request.
#[derive(Debug)]
pub enum CallEvent {
    Progress(String),
    Done(Result<Value, CallFailure>),
}

enum Command {
    Submit { request_id: String, frame: ClientMessage, events: mpsc::UnboundedSender<CallEvent> },
    Cancel { request_id: String },
}

struct Pending {
    frame: ClientMessage,
    events: mpsc::UnboundedSender<CallEvent>,
}

enum Routed {
    Delivered,
    Pong,
    /// The daemon reported an error that ends the connection.
    Fatal(String),
}

enum ServeExit {
    /// Every `ShimClient` is gone.
    Shutdown,
    Disconnected(String),
}

/// connect -> hello -> ack -> ping/pong. Also used by the health probe.
pub async fn handshake<T: DaemonTransport + ?Sized>(
    transport: &mut T,
    settings: &ConnectionSettings,
) -> Result<HelloReply, HandshakeError> {
    tokio::time::timeout(settings.handshake_timeout, handshake_steps(transport, settings))
        .await
        .map_err(|_| HandshakeError::TimedOut(settings.handshake_timeout))?
}

async fn handshake_steps<T: DaemonTransport + ?Sized>(
    transport: &mut T,
    settings: &ConnectionSettings,
) -> Result<HelloReply, HandshakeError> {
    transport.connect(&settings.url).await?;

    let hello = ClientMessage::Hello {
        session_id: settings.session_id.clone(),
        token: settings.token.clone(),
    };
    transport.send(encode(&hello)).await?;

    let reply = match next_frame(transport).await? {
        ServerFrame::Hello(reply) => reply,
        ServerFrame::Message(message) => {
            return Err(HandshakeError::Protocol(format!("expected hello reply, got {message:?}")))
        }
    };
    if !reply.ok {
        transport.close().await;
        return Err(HandshakeError::Rejected(
            reply.reason.unwrap_or_else(|| ErrorKind::AuthRejected.default_message().to_string()),
        ));
    }

    let nonce = uuid::Uuid::new_v4().to_string();
    transport.send(encode(&ClientMessage::Ping { nonce: Some(nonce.clone()) })).await?;
    loop {
        match next_frame(transport).await? {
            ServerFrame::Message(ServerMessage::Pong { nonce: Some(echo) }) if echo == nonce => {
                return Ok(reply)
            }
            other => debug!(frame = ?other, "skipping frame while awaiting handshake pong"),
        }
    }
}

async fn next_frame<T: DaemonTransport + ?Sized>(
    transport: &mut T,
) -> Result<ServerFrame, HandshakeError> {
    let raw = transport.recv().await?.ok_or(HandshakeError::Closed)?;
    decode_server_frame(&raw).map_err(|error| HandshakeError::Protocol(error.to_string()))
}

fn encode(message: &ClientMessage) -> String {
    // ClientMessage holds only strings and JSON values.
    encode_message(message).unwrap_or_default()
}

/// Owns the transport; runs until every `ShimClient` handle is dropped.
pub struct ConnectionActor<T> {
    transport: T,
    settings: ConnectionSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: HashMap<String, Pending>,
    backoff: Backoff,
}

/// Spawn the actor and return the handle callers use.
pub fn spawn<T>(transport: T, settings: ConnectionSettings, shim_timeout: Duration) -> ShimClient
where
    T: DaemonTransport + 'static,
{
    let (client, actor) = ConnectionActor::new(transport, settings, shim_timeout);
    tokio::spawn(actor.run());
    client
}

impl<T: DaemonTransport> ConnectionActor<T> {
    pub fn new(
        transport: T,
        settings: ConnectionSettings,
        shim_timeout: Duration,
    ) -> (ShimClient, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(settings.reconnect);
        let actor = Self { transport, settings, commands: rx, pending: HashMap::new(), backoff };
        (ShimClient { commands: tx, shim_timeout }, actor)
    }

    pub async fn run(mut self) {
        loop {
            match handshake(&mut self.transport, &self.settings).await {
                Ok(reply) => {
                    info!(
                        url = %self.settings.url,
                        session_id = %self.settings.session_id,
                        server_version = ?reply.server_version,
                        attempts = self.backoff.attempts(),
                        pending = self.pending.len(),
                        "connected to daemon"
                    );
                    self.backoff.reset();
                    match self.serve().await {
                        ServeExit::Shutdown => {
                            self.transport.close().await;
                            return;
                        }
                        ServeExit::Disconnected(reason) => {
                            warn!(%reason, pending = self.pending.len(), "lost daemon connection");
                            self.transport.close().await;
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        %error,
                        attempt = self.backoff.attempts() + 1,
                        url = %self.settings.url,
                        "daemon connection attempt failed"
                    );
                    self.transport.close().await;
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            if !self.wait_offline(delay).await {
                return;
            }
        }
    }

    /// Sleep out a backoff delay while still accepting calls. Returns false
    /// once every client handle is gone.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Submit { request_id, frame, events }) => {
                        self.pending.insert(request_id, Pending { frame, events });
                    }
                    Some(Command::Cancel { request_id }) => {
                        self.pending.remove(&request_id);
                    }
                },
            }
        }
    }

    async fn serve(&mut self) -> ServeExit {
        let mut resend: Vec<String> =
            self.pending.values().map(|pending| encode(&pending.frame)).collect();
        if !resend.is_empty() {
            info!(count = resend.len(), "re-issuing calls after reconnect");
        }
        for frame in resend.drain(..) {
            if let Err(error) = self.transport.send(frame).await {
                return ServeExit::Disconnected(error.to_string());
            }
        }

        let mut keepalive = tokio::time::interval(self.settings.ping_interval);
        keepalive.reset();
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = until(pong_deadline) => {
                    return ServeExit::Disconnected("daemon did not answer ping".into());
                }
                _ = keepalive.tick() => {
                    if let Err(error) = self.transport.send(encode(&ClientMessage::Ping { nonce: None })).await {
                        return ServeExit::Disconnected(error.to_string());
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.settings.ping_interval);
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return ServeExit::Shutdown;
                    };
                    if let Err(error) = self.forward(command).await {
                        return ServeExit::Disconnected(error.to_string());
                    }
                }
                frame = self.transport.recv() => match frame {
                    Ok(Some(raw)) => match self.route(&raw) {
                        Routed::Delivered => {}
                        Routed::Pong => pong_deadline = None,
                        Routed::Fatal(reason) => return ServeExit::Disconnected(reason),
                    },
                    Ok(None) => return ServeExit::Disconnected("closed by daemon".into()),
                    Err(error) => return ServeExit::Disconnected(error.to_string()),
                },
            }
        }
    }

    async fn forward(&mut self, command: Command) -> Result<(), TransportError> {
        match command {
            Command::Submit { request_id, frame, events } => {
                let raw = encode(&frame);
                // Record first: if the send fails the call is re-issued later.
                self.pending.insert(request_id, Pending { frame, events });
                self.transport.send(raw).await
            }
            Command::Cancel { request_id } => {
                if self.pending.remove(&request_id).is_some() {
                    self.transport.send(encode(&ClientMessage::Cancel { request_id })).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Deliver one daemon frame to the call it belongs to.
    fn route(&mut self, raw: &str) -> Routed {
        let message = match decode_server_frame(raw) {
            Ok(ServerFrame::Message(message)) => message,
            Ok(ServerFrame::Hello(reply)) => {
                debug!(?reply, "ignoring hello reply outside the handshake");
                return Routed::Delivered;
            }
            Err(error) => {
                warn!(%error, "undecodable frame from daemon");
                return Routed::Delivered;
            }
        };

        match message {
            ServerMessage::Pong { .. } => return Routed::Pong,
            ServerMessage::Progress { request_id, message } => {
                self.notify(&request_id, CallEvent::Progress(message));
            }
            ServerMessage::Result { request_id, payload } => {
                self.complete(&request_id, Ok(payload));
            }
            ServerMessage::Error { request_id: Some(request_id), kind, message, .. }
                if kind.is_informational() =>
            {
                self.notify(&request_id, CallEvent::Progress(message));
            }
            ServerMessage::Error { request_id: Some(request_id), kind, message, partial } => {
                self.complete(&request_id, Err(CallFailure { kind, message, partial }));
            }
            ServerMessage::Error { request_id: None, kind, message, .. } => {
                warn!(kind = kind.as_str(), %message, "daemon reported a connection-level error");
                if kind.is_terminal_for_connection() {
                    return Routed::Fatal(format!("{kind}: {message}"));
                }
            }
        }
        Routed::Delivered
    }

    fn notify(&self, request_id: &str, event: CallEvent) {
        match self.pending.get(request_id) {
            Some(pending) => {
                let _ = pending.events.send(event);
            }
            None => debug!(%request_id, "frame for unknown request"),
        }
    }

    fn complete(&mut self, request_id: &str, outcome: Result<Value, CallFailure>) {
        match self.pending.remove(request_id) {
            Some(pending) => {
                let _ = pending.events.send(CallEvent::Done(outcome));
            }
            None => debug!(%request_id, "outcome for unknown request"),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to the connection actor.
#[derive(Clone)]
pub struct ShimClient {
    commands: mpsc::UnboundedSender<Command>,
    shim_timeout: Duration,
}

impl ShimClient {
    pub fn shim_timeout(&self) -> Duration {
        self.shim_timeout
    }

    /// Run `tool` on the daemon, reporting progress lines to `on_progress`.
    /// Bounded by the shim timeout; on expiry the daemon is told to cancel.
    pub async fn call(
        &self,
        tool: &str,
        params: Value,
        on_progress: impl FnMut(String),
    ) -> Result<Value, CallFailure> {
        let request_id = next_request_id();
        let frame = ClientMessage::CallTool {
            request_id: request_id.clone(),
            tool: tool.to_string(),
            params,
        };
        self.request(request_id, frame, on_progress).await
    }

    /// Tool descriptors advertised by the daemon.
    pub async fn list_tools(&self) -> Result<Value, CallFailure> {
        let request_id = next_request_id();
        let frame = ClientMessage::ListTools { request_id: request_id.clone() };
        self.request(request_id, frame, |_| {}).await
    }

    async fn request(
        &self,
        request_id: String,
        frame: ClientMessage,
        mut on_progress: impl FnMut(String),
    ) -> Result<Value, CallFailure> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let submit = Command::Submit { request_id: request_id.clone(), frame, events: events_tx };
        if self.commands.send(submit).is_err() {
            return Err(CallFailure::new(ErrorKind::ToolCancelled, "shim connection is shutting down"));
        }

        let deadline = Instant::now() + self.shim_timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(CallEvent::Progress(message))) => on_progress(message),
                Ok(Some(CallEvent::Done(outcome))) => return outcome,
                Ok(None) => {
                    return Err(CallFailure::new(
                        ErrorKind::ToolCancelled,
                        "shim connection is shutting down",
                    ))
                }
                Err(_) => {
                    let _ = self.commands.send(Command::Cancel { request_id: request_id.clone() });
                    warn!(%request_id, timeout_secs = self.shim_timeout.as_secs_f64(), "shim timeout");
                    return Err(CallFailure::new(
                        ErrorKind::Timeout,
                        format!("shim timeout after {:.1}s", self.shim_timeout.as_secs_f64()),
                    ));
                }
            }
        }
    }
}

fn next_request_id() -> String {
    format!("shim-{}", uuid::Uuid::new_v4())
}
