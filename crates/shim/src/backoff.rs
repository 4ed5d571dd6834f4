// Reconnection backoff: exponential growth, random jitter, hard cap.

use std::time::Duration;

use conclave_common::ConfigError;
use rand::Rng;

/// Reconnection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth per failed attempt.
    pub factor: f64,
    /// Upper bound of the random extra, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 1.5,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid("reconnect_base_delay must be positive".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(format!(
                "reconnect_max_delay ({:?}) is below reconnect_base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect_factor must be a finite number >= 1 (got {})",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "reconnect_jitter must be in [0, 1) (got {})",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before retry `attempt` (0-based) for a jitter sample in `[0, 1)`:
    /// `base × factor^attempt`, plus up to `jitter` of itself, capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let jittered = grown * (1.0 + self.jitter * jitter_sample.clamp(0.0, 1.0));
        let capped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Attempt counter over a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the current attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let sample = if self.policy.jitter > 0.0 { rand::thread_rng().gen::<f64>() } else { 0.0 };
        let delay = self.policy.delay_for(self.attempt, sample);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy { jitter: 0.0, ..ReconnectPolicy::default() }
    }

    #[test]
    fn delay_starts_at_base_and_grows_by_factor() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(375));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs_f64(0.5625));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(40, 0.0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX, 0.9), Duration::from_secs(30));
    }

    #[test]
    fn jitter_adds_at_most_its_fraction() {
        let policy = ReconnectPolicy::default();
        let plain = policy.delay_for(3, 0.0);
        let jittered = policy.delay_for(3, 0.999);
        assert!(jittered > plain);
        assert!(jittered.as_secs_f64() < plain.as_secs_f64() * 1.1 + 1e-9);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(0.5625));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let base = ReconnectPolicy::default();
        assert!(base.validate().is_ok());
        assert!(ReconnectPolicy { base_delay: Duration::ZERO, ..base }.validate().is_err());
        assert!(ReconnectPolicy { max_delay: Duration::from_millis(10), ..base }.validate().is_err());
        assert!(ReconnectPolicy { factor: 0.5, ..base }.validate().is_err());
        assert!(ReconnectPolicy { jitter: 1.0, ..base }.validate().is_err());
    }

    proptest! {
        #[test]
        fn delays_never_shrink_and_never_exceed_the_cap(
            base_ms in 1u64..5_000,
            extra_ms in 0u64..120_000,
            factor in 1.0f64..4.0,
            jitter in 0.0f64..0.99,
            sample in 0.0f64..1.0,
            attempt in 0u32..200,
        ) {
            let policy = ReconnectPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                factor,
                jitter,
            };
            let current = policy.delay_for(attempt, sample);
            let next = policy.delay_for(attempt + 1, sample);
            prop_assert!(next >= current);
            prop_assert!(next <= policy.max_delay);
            prop_assert!(current.as_secs_f64() + 1e-9 >= policy.base_delay.as_secs_f64());
        }
    }
}
