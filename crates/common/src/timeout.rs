// Timeout hierarchy: every layer derives from the tool timeout.
//
//   expert  = 0.8 × tool
//   tool    = base
//   daemon  = 1.5 × tool
//   shim    = 2.0 × tool
//   client  = 2.5 × tool
//
// An outer layer must never give up before an inner one could still succeed,
// so the ordering is checked once at startup and never again.

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;

pub const EXPERT_MULTIPLIER: f64 = 0.8;
pub const DAEMON_MULTIPLIER: f64 = 1.5;
pub const SHIM_MULTIPLIER: f64 = 2.0;
pub const CLIENT_MULTIPLIER: f64 = 2.5;

/// Largest accepted tool timeout (one week).
pub const MAX_TOOL_TIMEOUT_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Bounds for every other duration setting. The floor keeps tokio intervals
/// non-zero; the ceiling keeps `Instant + duration` from overflowing.
pub const MIN_SETTING_SECS: f64 = 0.001;
pub const MAX_SETTING_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "CONFIG_INVALID: {inner_layer} timeout ({inner:?}) must be shorter than {outer_layer} timeout ({outer:?})"
    )]
    Ordering {
        inner_layer: &'static str,
        inner: Duration,
        outer_layer: &'static str,
        outer: Duration,
    },

    #[error("CONFIG_INVALID: tool timeout must be a positive, finite number of seconds (got {0})")]
    NonPositive(f64),

    #[error("CONFIG_INVALID: tool timeout {0}s exceeds the maximum of {MAX_TOOL_TIMEOUT_SECS}s")]
    TooLarge(f64),

    #[error("CONFIG_INVALID: {0}")]
    Invalid(String),
}

/// Convert a seconds setting to a `Duration`, rejecting anything outside
/// `MIN_SETTING_SECS..=MAX_SETTING_SECS`.
pub fn setting_duration(name: &str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds (got {secs})"
        )));
    }
    if secs < MIN_SETTING_SECS {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at least {MIN_SETTING_SECS}s (got {secs})"
        )));
    }
    if secs > MAX_SETTING_SECS {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at most {MAX_SETTING_SECS}s (got {secs})"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|error| ConfigError::Invalid(format!("{name}: {error}")))
}

/// Like `setting_duration`, but clamps instead of failing. For getters on
/// configs that may not have been validated.
pub fn clamped_setting_duration(secs: f64) -> Duration {
    let secs = if secs.is_nan() { MIN_SETTING_SECS } else { secs };
    Duration::from_secs_f64(secs.clamp(MIN_SETTING_SECS, MAX_SETTING_SECS))
}

impl ConfigError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigInvalid
    }
}

/// The validated, immutable timeout hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    expert_timeout: Duration,
    tool_timeout: Duration,
    daemon_timeout: Duration,
    shim_timeout: Duration,
    client_timeout: Duration,
}

impl TimeoutConfig {
    /// Derive every layer from `tool_timeout` and validate the result.
    pub fn build(tool_timeout: Duration) -> Result<Self, ConfigError> {
        Self::from_secs(tool_timeout.as_secs_f64())
    }

    pub fn from_secs(tool_timeout_secs: f64) -> Result<Self, ConfigError> {
        if !tool_timeout_secs.is_finite() || tool_timeout_secs <= 0.0 {
            return Err(ConfigError::NonPositive(tool_timeout_secs));
        }
        if tool_timeout_secs > MAX_TOOL_TIMEOUT_SECS {
            return Err(ConfigError::TooLarge(tool_timeout_secs));
        }

        let tool_timeout = Duration::from_secs_f64(tool_timeout_secs);
        Self::from_parts(
            tool_timeout.mul_f64(EXPERT_MULTIPLIER),
            tool_timeout,
            tool_timeout.mul_f64(DAEMON_MULTIPLIER),
            tool_timeout.mul_f64(SHIM_MULTIPLIER),
            tool_timeout.mul_f64(CLIENT_MULTIPLIER),
        )
    }

    /// Assemble an explicit hierarchy. Fails unless every layer is strictly
    /// shorter than the one wrapping it.
    pub fn from_parts(
        expert_timeout: Duration,
        tool_timeout: Duration,
        daemon_timeout: Duration,
        shim_timeout: Duration,
        client_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { expert_timeout, tool_timeout, daemon_timeout, shim_timeout, client_timeout };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expert_timeout.is_zero() {
            return Err(ConfigError::NonPositive(0.0));
        }

        let layers = [
            ("expert", self.expert_timeout),
            ("tool", self.tool_timeout),
            ("daemon", self.daemon_timeout),
            ("shim", self.shim_timeout),
            ("client", self.client_timeout),
        ];
        for pair in layers.windows(2) {
            let (inner_layer, inner) = pair[0];
            let (outer_layer, outer) = pair[1];
            if inner >= outer {
                return Err(ConfigError::Ordering { inner_layer, inner, outer_layer, outer });
            }
        }
        Ok(())
    }

    pub fn expert_timeout(&self) -> Duration {
        self.expert_timeout
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    pub fn daemon_timeout(&self) -> Duration {
        self.daemon_timeout
    }

    pub fn shim_timeout(&self) -> Duration {
        self.shim_timeout
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// `(tool, daemon, shim, client)` in seconds.
    pub fn hierarchy_secs(&self) -> (f64, f64, f64, f64) {
        (
            self.tool_timeout.as_secs_f64(),
            self.daemon_timeout.as_secs_f64(),
            self.shim_timeout.as_secs_f64(),
            self.client_timeout.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_tool_timeout_derives_documented_hierarchy() {
        let config = TimeoutConfig::build(Duration::from_secs(120)).expect("120s is valid");
        assert!(config.validate().is_ok());
        assert_eq!(config.hierarchy_secs(), (120.0, 180.0, 240.0, 300.0));
        assert!(config.expert_timeout() < config.tool_timeout());
    }

    #[test]
    fn daemon_not_longer_than_tool_fails_validation() {
        let tool = Duration::from_secs(120);
        let error = TimeoutConfig::from_parts(
            Duration::from_secs(90),
            tool,
            tool,
            Duration::from_secs(240),
            Duration::from_secs(300),
        )
        .expect_err("daemon == tool must be rejected");

        match &error {
            ConfigError::Ordering { inner_layer, outer_layer, .. } => {
                assert_eq!(*inner_layer, "tool");
                assert_eq!(*outer_layer, "daemon");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(error.kind(), ErrorKind::ConfigInvalid);
        assert!(error.to_string().starts_with("CONFIG_INVALID"));
    }

    #[test]
    fn shorter_daemon_fails_validation() {
        let error = TimeoutConfig::from_parts(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(20),
            Duration::from_secs(25),
        );
        assert!(matches!(error, Err(ConfigError::Ordering { inner_layer: "tool", .. })));
    }

    #[test]
    fn rejects_non_positive_and_non_finite_base() {
        assert!(matches!(TimeoutConfig::from_secs(0.0), Err(ConfigError::NonPositive(_))));
        assert!(matches!(TimeoutConfig::from_secs(-3.0), Err(ConfigError::NonPositive(_))));
        assert!(matches!(TimeoutConfig::from_secs(f64::NAN), Err(ConfigError::NonPositive(_))));
        assert!(matches!(
            TimeoutConfig::from_secs(f64::INFINITY),
            Err(ConfigError::NonPositive(_))
        ));
    }

    #[test]
    fn rejects_absurdly_large_base() {
        assert!(matches!(
            TimeoutConfig::from_secs(MAX_TOOL_TIMEOUT_SECS * 2.0),
            Err(ConfigError::TooLarge(_))
        ));
    }

    #[test]
    fn setting_duration_rejects_values_that_round_to_zero_or_overflow() {
        assert!(setting_duration("ping_interval_secs", 1e-12).is_err());
        assert!(setting_duration("ping_interval_secs", 0.0).is_err());
        assert!(setting_duration("ttl_secs", 1e30).is_err());
        assert!(setting_duration("ttl_secs", f64::INFINITY).is_err());
        assert_eq!(setting_duration("ttl_secs", 0.25).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn clamped_setting_duration_never_panics() {
        assert_eq!(clamped_setting_duration(1e-12), Duration::from_millis(1));
        assert_eq!(clamped_setting_duration(f64::NAN), Duration::from_millis(1));
        assert_eq!(
            clamped_setting_duration(1e30),
            Duration::from_secs_f64(MAX_SETTING_SECS)
        );
    }

    proptest! {
        #[test]
        fn derived_layers_follow_fixed_multipliers(tool_secs in 0.01f64..100_000.0) {
            let config = TimeoutConfig::from_secs(tool_secs).unwrap();
            let (tool, daemon, shim, client) = config.hierarchy_secs();
            prop_assert!((tool - tool_secs).abs() < 1e-6);
            prop_assert!((daemon - tool_secs * 1.5).abs() < 1e-6);
            prop_assert!((shim - tool_secs * 2.0).abs() < 1e-6);
            prop_assert!((client - tool_secs * 2.5).abs() < 1e-6);
            prop_assert!(config.expert_timeout() < config.tool_timeout());
            prop_assert!(tool < daemon && daemon < shim && shim < client);
        }
    }
}
