use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter};

/// What the engine does when readiness probes never succeed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Log the failure and exit the process with status 1.
    #[default]
    Exit,
    /// Return the error from `Controller::run` and let the caller decide.
    Return,
}

/// Engine settings that are not part of a controller's wiring.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long `run` waits for readiness probes, in milliseconds.
    pub readiness_timeout_ms: u64,
    /// Interval between readiness polls, in milliseconds.
    pub readiness_poll_interval_ms: u64,
    /// Resync intervals below this emit a `FastControllerResync` warning.
    pub resync_warning_floor_secs: u64,
    /// Delay before a worker restarts after a handled panic, in milliseconds.
    pub worker_restart_period_ms: u64,
    /// Behaviour on readiness timeout.
    pub fatal_policy: FatalPolicy,
    /// Backoff settings for the controller's work queue.
    pub rate_limiter: RateLimiterConfig,
}

impl ControllerConfig {
    /// Set the readiness timeout.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout_ms = duration_millis(timeout);
        self
    }

    /// Set the fatal policy.
    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    /// Set the worker restart period.
    pub fn with_worker_restart_period(mut self, period: Duration) -> Self {
        self.worker_restart_period_ms = duration_millis(period);
        self
    }

    /// Set the rate limiter settings.
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub(crate) fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub(crate) fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms.max(1))
    }

    pub(crate) fn resync_warning_floor(&self) -> Duration {
        Duration::from_secs(self.resync_warning_floor_secs)
    }

    pub(crate) fn worker_restart_period(&self) -> Duration {
        Duration::from_millis(self.worker_restart_period_ms)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: 600_000,
            readiness_poll_interval_ms: 100,
            resync_warning_floor_secs: 60,
            worker_restart_period_ms: 1000,
            fatal_policy: FatalPolicy::Exit,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the per-key delay, in seconds.
    pub max_delay_secs: u64,
    /// Sustained insertions per second across all keys.
    pub qps: u32,
    /// Burst capacity of the token bucket.
    pub burst: u32,
}

impl RateLimiterConfig {
    /// Build the limiter described by this configuration.
    pub fn build(&self) -> MaxOfRateLimiter {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_secs(self.max_delay_secs),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 10,
            burst: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"readiness_timeout_ms": 5000, "fatal_policy": "return"}"#)
                .unwrap();
        assert_eq!(config.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(config.fatal_policy, FatalPolicy::Return);
        assert_eq!(config.resync_warning_floor(), Duration::from_secs(60));
        assert_eq!(config.rate_limiter.base_delay_ms, 5);
        assert_eq!(config.rate_limiter.burst, 100);
    }

    #[test]
    fn test_setters() {
        let config = ControllerConfig::default()
            .with_readiness_timeout(Duration::from_millis(1500))
            .with_worker_restart_period(Duration::from_millis(20))
            .with_fatal_policy(FatalPolicy::Return);
        assert_eq!(config.readiness_timeout(), Duration::from_millis(1500));
        assert_eq!(config.worker_restart_period(), Duration::from_millis(20));
        assert_eq!(config.fatal_policy, FatalPolicy::Return);
    }

    #[test]
    fn test_sub_second_durations_are_kept() {
        let config = ControllerConfig::default()
            .with_readiness_timeout(Duration::from_millis(500))
            .with_worker_restart_period(Duration::MAX);
        assert_eq!(config.readiness_timeout_ms, 500);
        assert_eq!(config.worker_restart_period_ms, u64::MAX);
    }
}
