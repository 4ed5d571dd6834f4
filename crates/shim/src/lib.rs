// conclave-shim: keeps a local caller connected to the daemon across daemon
// restarts.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod local;
pub mod probe;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use config::ShimConfig;
pub use connection::{CallFailure, ConnectionSettings, ShimClient};

/// Connection settings for a parsed configuration. `session_id` is resolved
/// once by the caller so it survives reconnects.
pub fn connection_settings(
    config: &ShimConfig,
    session_id: String,
) -> Result<ConnectionSettings, conclave_common::ConfigError> {
    Ok(ConnectionSettings {
        url: config.daemon_url.clone(),
        session_id,
        token: config.token.clone(),
        handshake_timeout: config.handshake_timeout(),
        ping_interval: config.ping_interval(),
        reconnect: config.reconnect_policy()?,
    })
}
