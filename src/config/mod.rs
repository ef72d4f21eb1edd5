pub mod policy;

pub use policy::{BackoffPolicy, BreakerMode, BreakerPolicy, ProgressWeights, WatchdogPolicy};

use crate::core::{BootError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Boot orchestration configuration
///
/// Every field has a default, so a partial JSON document (or none at all)
/// is enough to get going.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootConfig {
    /// Per-stage deadlines
    pub watchdog: WatchdogPolicy,

    /// Stage weights for the overall progress figure
    pub progress: ProgressWeights,

    /// Retry schedule used by resilience policies
    pub backoff: BackoffPolicy,

    /// Circuit breaker thresholds used by resilience policies
    pub breaker: BreakerPolicy,

    /// Platform label stamped into each session
    pub platform: String,

    /// Application version stamped into each session
    pub app_version: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogPolicy::default(),
            progress: ProgressWeights::default(),
            backoff: BackoffPolicy::default(),
            breaker: BreakerPolicy::default(),
            platform: std::env::consts::OS.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BootConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file on disk
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Set the bootstrap stage deadline
    pub fn stage0_deadline(mut self, deadline: Duration) -> Self {
        self.watchdog.stage0_deadline_ms = duration_ms(deadline);
        self
    }

    /// Set the services stage deadline
    pub fn stage1_deadline(mut self, deadline: Duration) -> Self {
        self.watchdog.stage1_deadline_ms = duration_ms(deadline);
        self
    }

    /// Set the application-ready stage deadline
    pub fn stage2_deadline(mut self, deadline: Duration) -> Self {
        self.watchdog.stage2_deadline_ms = duration_ms(deadline);
        self
    }

    /// Set how long cancelled inits may linger before being dropped
    pub fn cancellation_grace(mut self, grace: Duration) -> Self {
        self.watchdog.cancellation_grace_ms = duration_ms(grace);
        self
    }

    pub fn progress_weights(mut self, weights: ProgressWeights) -> Self {
        self.progress = weights;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn breaker(mut self, breaker: BreakerPolicy) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn app_version(mut self, version: &str) -> Self {
        self.app_version = version.to_string();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let watchdog = &self.watchdog;
        if watchdog.stage0_deadline_ms == 0
            || watchdog.stage1_deadline_ms == 0
            || watchdog.stage2_deadline_ms == 0
        {
            return Err(BootError::InvalidConfig(
                "stage deadlines must be > 0".to_string(),
            ));
        }

        if self.progress.total() == 0 {
            return Err(BootError::InvalidConfig(
                "progress weights cannot all be zero".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.backoff.jitter_factor) {
            return Err(BootError::InvalidConfig(
                "backoff.jitter_factor must be in [0, 1)".to_string(),
            ));
        }

        let breaker = &self.breaker;
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(BootError::InvalidConfig(
                "breaker.failure_rate_threshold must be in (0, 1]".to_string(),
            ));
        }

        if breaker.minimum_throughput == 0 || breaker.consecutive_failure_threshold == 0 {
            return Err(BootError::InvalidConfig(
                "breaker thresholds must be > 0".to_string(),
            ));
        }

        if breaker.sampling_window_ms == 0 {
            return Err(BootError::InvalidConfig(
                "breaker.sampling_window_ms must be > 0".to_string(),
            ));
        }

        if breaker.recovery_delays_ms.is_empty() {
            return Err(BootError::InvalidConfig(
                "breaker.recovery_delays_ms cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BootConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.watchdog.stage1_deadline_ms, 3_000);
        assert_eq!(config.backoff.max_retries(), 5);
    }

    #[test]
    fn test_builder_pattern() {
        let config = BootConfig::new()
            .stage0_deadline(Duration::from_millis(250))
            .stage1_deadline(Duration::from_secs(10))
            .platform("test-rig")
            .app_version("9.9.9");

        assert_eq!(config.watchdog.stage0_deadline_ms, 250);
        assert_eq!(config.watchdog.stage1_deadline_ms, 10_000);
        assert_eq!(config.platform, "test-rig");
        assert_eq!(config.app_version, "9.9.9");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BootConfig::from_json_str(
            r#"{ "watchdog": { "stage1_deadline_ms": 5000 }, "breaker": { "mode": "ConsecutiveFailures" } }"#,
        )
        .unwrap();

        assert_eq!(config.watchdog.stage1_deadline_ms, 5_000);
        assert_eq!(config.watchdog.stage0_deadline_ms, 1_000);
        assert_eq!(config.breaker.mode, BreakerMode::ConsecutiveFailures);
        assert_eq!(config.breaker.minimum_throughput, 5);
    }

    #[test]
    fn test_validate() {
        let zero_deadline = BootConfig::new().stage2_deadline(Duration::ZERO);
        assert!(zero_deadline.validate().is_err());

        let mut bad_weights = BootConfig::new();
        bad_weights.progress = ProgressWeights {
            stage0: 0,
            stage1: 0,
            stage2: 0,
        };
        assert!(bad_weights.validate().is_err());

        let mut bad_jitter = BootConfig::new();
        bad_jitter.backoff.jitter_factor = 1.5;
        assert!(bad_jitter.validate().is_err());

        let mut no_delays = BootConfig::new();
        no_delays.breaker.recovery_delays_ms.clear();
        assert!(no_delays.validate().is_err());
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = BootConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, BootError::Serialization(_)));
    }
}
