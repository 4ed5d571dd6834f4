// Shim settings: flags, each also readable from the environment.

use std::time::Duration;

use clap::Args;
use conclave_common::{clamped_setting_duration, setting_duration, ConfigError, TimeoutConfig};

use crate::backoff::ReconnectPolicy;

#[derive(Debug, Clone, Args)]
pub struct ShimConfig {
    /// WebSocket endpoint of the daemon.
    #[arg(long, env = "CONCLAVE_DAEMON_URL", default_value = "ws://127.0.0.1:8765/ws")]
    pub daemon_url: String,

    /// Session id presented in every hello. Defaults to a random UUID that
    /// stays fixed for the life of the process.
    #[arg(long, env = "CONCLAVE_SHIM_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "CONCLAVE_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Base of the timeout hierarchy; must match the daemon's.
    #[arg(long, env = "CONCLAVE_TOOL_TIMEOUT_SECS", default_value_t = 120.0)]
    pub tool_timeout_secs: f64,

    #[arg(long, env = "CONCLAVE_SHIM_RECONNECT_BASE_DELAY", default_value_t = 0.25)]
    pub reconnect_base_delay: f64,

    #[arg(long, env = "CONCLAVE_SHIM_RECONNECT_MAX_DELAY", default_value_t = 30.0)]
    pub reconnect_max_delay: f64,

    #[arg(long, env = "CONCLAVE_SHIM_RECONNECT_FACTOR", default_value_t = 1.5)]
    pub reconnect_factor: f64,

    /// Random extra delay, as a fraction of each backoff delay.
    #[arg(long, env = "CONCLAVE_SHIM_RECONNECT_JITTER", default_value_t = 0.1)]
    pub reconnect_jitter: f64,

    /// Budget for connect + hello + ping on each attempt.
    #[arg(long, env = "CONCLAVE_SHIM_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10.0)]
    pub handshake_timeout_secs: f64,

    /// Application-level ping cadence on an established connection.
    #[arg(long, env = "CONCLAVE_SHIM_PING_INTERVAL_SECS", default_value_t = 15.0)]
    pub ping_interval_secs: f64,

    /// Tracing filter when `CONCLAVE_LOG` / `RUST_LOG` are unset. Logs go to
    /// stderr; stdout carries the protocol.
    #[arg(long, env = "CONCLAVE_SHIM_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

impl ShimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts()?;
        self.reconnect_policy()?;
        url::Url::parse(&self.daemon_url).map_err(|error| {
            ConfigError::Invalid(format!("daemon_url `{}` is not a URL: {error}", self.daemon_url))
        })?;
        setting_duration("handshake_timeout_secs", self.handshake_timeout_secs)?;
        setting_duration("ping_interval_secs", self.ping_interval_secs)?;
        Ok(())
    }

    pub fn timeouts(&self) -> Result<TimeoutConfig, ConfigError> {
        TimeoutConfig::from_secs(self.tool_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> Result<ReconnectPolicy, ConfigError> {
        let policy = ReconnectPolicy {
            base_delay: setting_duration("reconnect_base_delay", self.reconnect_base_delay)?,
            max_delay: setting_duration("reconnect_max_delay", self.reconnect_max_delay)?,
            factor: self.reconnect_factor,
            jitter: self.reconnect_jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// The configured session id, or a fresh UUID.
    pub fn resolve_session_id(&self) -> String {
        self.session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn handshake_timeout(&self) -> Duration {
        clamped_setting_duration(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        clamped_setting_duration(self.ping_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ShimConfig,
    }

    fn parse(args: &[&str]) -> ShimConfig {
        let mut argv = vec!["conclave-shim"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn defaults_match_the_daemon() {
        let config = parse(&[]);
        assert_eq!(config.daemon_url, "ws://127.0.0.1:8765/ws");
        assert!(config.validate().is_ok());

        let policy = config.reconnect_policy().unwrap();
        assert_eq!(policy, ReconnectPolicy::default());
        assert_eq!(config.timeouts().unwrap().shim_timeout(), Duration::from_secs(240));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--daemon-url",
            "ws://10.0.0.2:9000/ws",
            "--session-id",
            "fixed",
            "--tool-timeout-secs",
            "60",
            "--reconnect-max-delay",
            "5",
        ]);
        assert_eq!(config.resolve_session_id(), "fixed");
        assert_eq!(config.timeouts().unwrap().tool_timeout(), Duration::from_secs(60));
        assert_eq!(config.reconnect_policy().unwrap().max_delay, Duration::from_secs(5));
    }

    #[test]
    fn generated_session_id_is_a_uuid() {
        let config = parse(&[]);
        let id = config.resolve_session_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(parse(&["--tool-timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--reconnect-factor", "0.5"]).validate().is_err());
        assert!(parse(&["--reconnect-base-delay", "-1"]).validate().is_err());
        assert!(parse(&["--daemon-url", "not a url"]).validate().is_err());

        let error = parse(&["--reconnect-jitter", "2"]).validate().unwrap_err();
        assert_eq!(error.kind(), conclave_common::ErrorKind::ConfigInvalid);
    }

    #[test]
    fn keepalive_interval_that_rounds_to_zero_is_rejected() {
        let config = parse(&["--ping-interval-secs", "1e-12"]);
        assert!(config.validate().is_err());
        assert!(!config.ping_interval().is_zero());
        assert!(parse(&["--reconnect-max-delay", "1e30"]).validate().is_err());
    }
}
