use crate::core::BootStage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-stage wall-clock budgets enforced by the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogPolicy {
    pub stage0_deadline_ms: u64,
    pub stage1_deadline_ms: u64,
    pub stage2_deadline_ms: u64,
    /// How long a cancelled service may keep running before its init future
    /// is dropped.
    pub cancellation_grace_ms: u64,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            stage0_deadline_ms: 1_000,
            stage1_deadline_ms: 3_000,
            stage2_deadline_ms: 1_000,
            cancellation_grace_ms: 500,
        }
    }
}

impl WatchdogPolicy {
    pub fn deadline_for(&self, stage: BootStage) -> Duration {
        let ms = match stage {
            BootStage::Bootstrap => self.stage0_deadline_ms,
            BootStage::Services => self.stage1_deadline_ms,
            BootStage::ApplicationReady => self.stage2_deadline_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}

/// Relative share of the overall progress bar owned by each stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressWeights {
    pub stage0: u32,
    pub stage1: u32,
    pub stage2: u32,
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            stage0: 10,
            stage1: 65,
            stage2: 25,
        }
    }
}

impl ProgressWeights {
    pub fn weight_for(&self, stage: BootStage) -> u32 {
        match stage {
            BootStage::Bootstrap => self.stage0,
            BootStage::Services => self.stage1,
            BootStage::ApplicationReady => self.stage2,
        }
    }

    pub fn total(&self) -> u32 {
        self.stage0
            .saturating_add(self.stage1)
            .saturating_add(self.stage2)
    }
}

/// Retry delays for transient failures. One retry per table entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub delays_ms: Vec<u64>,
    /// Uniform jitter applied to each delay, as a fraction of it.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000],
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn max_retries(&self) -> usize {
        self.delays_ms.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BreakerMode {
    /// Trip when the failure rate inside the sampling window reaches the
    /// threshold, once the window holds enough calls.
    #[default]
    FailureRate,
    /// Trip after a run of consecutive failures.
    ConsecutiveFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerPolicy {
    pub mode: BreakerMode,
    pub failure_rate_threshold: f64,
    pub sampling_window_ms: u64,
    pub minimum_throughput: usize,
    pub consecutive_failure_threshold: u32,
    /// Escalating open durations; the last entry repeats.
    pub recovery_delays_ms: Vec<u64>,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            mode: BreakerMode::FailureRate,
            failure_rate_threshold: 0.5,
            sampling_window_ms: 30_000,
            minimum_throughput: 5,
            consecutive_failure_threshold: 5,
            recovery_delays_ms: vec![30_000, 60_000, 120_000, 300_000, 600_000],
        }
    }
}

impl BreakerPolicy {
    pub fn consecutive() -> Self {
        Self {
            mode: BreakerMode::ConsecutiveFailures,
            ..Self::default()
        }
    }

    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }

    /// Open duration for the given table position, capped at the last entry.
    pub fn recovery_delay(&self, index: usize) -> Duration {
        let last = self.recovery_delays_ms.len().saturating_sub(1);
        let ms = self
            .recovery_delays_ms
            .get(index.min(last))
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn last_recovery_index(&self) -> usize {
        self.recovery_delays_ms.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_deadlines() {
        let policy = WatchdogPolicy::default();
        assert_eq!(policy.deadline_for(BootStage::Bootstrap), Duration::from_millis(1_000));
        assert_eq!(policy.deadline_for(BootStage::Services), Duration::from_millis(3_000));
        assert_eq!(
            policy.deadline_for(BootStage::ApplicationReady),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn test_default_weights_sum_to_hundred() {
        assert_eq!(ProgressWeights::default().total(), 100);
    }

    #[test]
    fn test_recovery_delay_caps_at_last_entry() {
        let policy = BreakerPolicy::default();
        assert_eq!(policy.recovery_delay(0), Duration::from_secs(30));
        assert_eq!(policy.recovery_delay(1), Duration::from_secs(60));
        assert_eq!(policy.recovery_delay(4), Duration::from_secs(600));
        assert_eq!(policy.recovery_delay(42), Duration::from_secs(600));
    }
}
