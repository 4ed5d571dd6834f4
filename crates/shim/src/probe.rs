// Health probe: one full handshake against the daemon.
//
// A bare TCP connect is not enough; the daemon expects a protocol-correct
// hello as the first frame and drops anything else.

use conclave_common::protocol::ws::HelloReply;
use tracing::info;

use crate::connection::{handshake, ConnectionSettings, HandshakeError};
use crate::transport::{DaemonTransport, WsTransport};

/// connect -> hello -> ack -> ping/pong, once.
pub async fn probe(settings: &ConnectionSettings) -> Result<HelloReply, HandshakeError> {
    probe_with(&mut WsTransport::new(), settings).await
}

pub async fn probe_with<T: DaemonTransport>(
    transport: &mut T,
    settings: &ConnectionSettings,
) -> Result<HelloReply, HandshakeError> {
    let result = handshake(transport, settings).await;
    transport.close().await;
    if let Ok(reply) = &result {
        info!(
            url = %settings.url,
            server_version = ?reply.server_version,
            tool_timeout_secs = ?reply.tool_timeout_secs,
            "daemon is healthy"
        );
    }
    result
}
