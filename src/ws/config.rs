#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use crate::Result;
use crate::error::Error;

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_MAX_INTERVAL_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.0;
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);

/// Reconnection policy for one logical connection.
///
/// With the default `backoff_multiplier` of `1.0` every retry waits exactly
/// `interval`. A larger multiplier grows the delay after each retry, capped at
/// `max_interval`; the sequence starts over whenever a connection opens.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_rpc_transport::ws::config::ReconnectConfig;
///
/// let config = ReconnectConfig::builder()
///     .interval(Duration::from_millis(100))
///     .max_attempts(3)
///     .timeout(Duration::from_millis(50))
///     .build();
/// assert!(config.enabled);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Whether a disconnect schedules any retry at all
    #[builder(default = true)]
    pub enabled: bool,
    /// Delay before each retry attempt
    #[builder(default = DEFAULT_RECONNECT_INTERVAL_DURATION)]
    pub interval: Duration,
    /// Consecutive retries allowed before giving up; restored on every successful open
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_attempts: u32,
    /// How long a single connection attempt may take to open
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    pub timeout: Duration,
    /// Growth factor applied to the retry delay after each retry
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
    /// Upper bound for a grown retry delay
    #[builder(default = DEFAULT_MAX_INTERVAL_DURATION)]
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::validation("connection timeout must be non-zero"));
        }
        Ok(())
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.interval)
            .with_max_interval(config.max_interval.max(config.interval))
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Configuration for [`WebSocketChannel`](super::socket::WebSocketChannel).
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ChannelConfig {
    /// Interval for sending PING frames. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum time to wait for a PONG before the channel is considered dead
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn default_policy() {
        let config = ReconnectConfig::default();

        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.timeout, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn default_backoff_is_fixed_interval() {
        let config = ReconnectConfig::builder()
            .interval(Duration::from_millis(100))
            .build();
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..5 {
            assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        }
    }

    #[test]
    fn backoff_grows_and_respects_max() {
        let config = ReconnectConfig::builder()
            .interval(Duration::from_secs(1))
            .max_interval(Duration::from_secs(3))
            .backoff_multiplier(2.0)
            .build();
        let mut backoff: ExponentialBackoff = config.into();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(3)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(3)));

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let config = ReconnectConfig::builder().backoff_multiplier(0.5).build();

        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), Kind::Validation);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ReconnectConfig::builder().timeout(Duration::ZERO).build();

        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_disabled_by_default() {
        let config = ChannelConfig::default();

        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
    }
}
