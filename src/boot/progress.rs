use crate::config::ProgressWeights;
use crate::core::BootStage;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// One progress notification as seen by subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootProgress {
    pub stage_number: u8,
    pub stage_name: String,
    pub stage_percent: u8,
    pub overall_percent: u8,
    pub status_message: String,
}

impl BootProgress {
    pub fn initial() -> Self {
        Self {
            stage_number: BootStage::Bootstrap.number(),
            stage_name: BootStage::Bootstrap.name().to_string(),
            stage_percent: 0,
            overall_percent: 0,
            status_message: "Waiting to start".to_string(),
        }
    }
}

/// Pure progress arithmetic over weighted stages.
#[derive(Debug, Clone, Default)]
pub struct BootProgressCalculator {
    weights: ProgressWeights,
}

impl BootProgressCalculator {
    pub fn new(weights: ProgressWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ProgressWeights {
        &self.weights
    }

    /// `100 * completed / total`, 0 when there is nothing to do.
    pub fn stage_progress(completed: u32, total: u32) -> u8 {
        if total == 0 {
            return 0;
        }
        let percent = u64::from(completed.min(total)) * 100 / u64::from(total);
        percent.min(100) as u8
    }

    /// Weighted mean of per-stage percentages, normalized by the weight sum.
    pub fn overall_progress(&self, stage_percents: [u8; 3]) -> u8 {
        let total = u64::from(self.weights.total());
        if total == 0 {
            return 0;
        }
        let weighted: u64 = BootStage::ALL
            .iter()
            .zip(stage_percents)
            .map(|(stage, percent)| {
                u64::from(self.weights.weight_for(*stage)) * u64::from(percent.min(100))
            })
            .sum();
        (weighted / total).min(100) as u8
    }

    /// Overall progress when `stage` is at `stage_percent` and every earlier
    /// stage has finished.
    pub fn overall_at(&self, stage: BootStage, stage_percent: u8) -> u8 {
        let mut percents = [0u8; 3];
        for earlier in BootStage::ALL.iter().filter(|s| **s < stage) {
            percents[earlier.number() as usize] = 100;
        }
        percents[stage.number() as usize] = stage_percent;
        self.overall_progress(percents)
    }

    /// Band of the overall bar owned by `stage`.
    pub fn stage_range(&self, stage: BootStage) -> (u8, u8) {
        let start = self.overall_at(stage, 0);
        let end = self.overall_at(stage, 100);
        (start, end)
    }

    /// Linear projection of the remaining time. `None` until there is both
    /// some progress and some elapsed time.
    pub fn estimate_time_remaining(overall_percent: u8, elapsed: Duration) -> Option<Duration> {
        if overall_percent == 0 || elapsed.is_zero() {
            return None;
        }
        if overall_percent >= 100 {
            return Some(Duration::ZERO);
        }
        let elapsed_ms = elapsed.as_millis() as f64;
        let projected_ms = elapsed_ms * 100.0 / f64::from(overall_percent);
        Some(Duration::from_millis((projected_ms - elapsed_ms).max(0.0) as u64))
    }

    pub fn format_time_remaining(remaining: Option<Duration>) -> String {
        let seconds = match remaining {
            Some(remaining) if !remaining.is_zero() => remaining.as_secs(),
            _ => return String::new(),
        };

        if seconds < 5 {
            "A few seconds...".to_string()
        } else if seconds < 60 {
            format!("About {seconds} seconds...")
        } else {
            let minutes = seconds / 60;
            let plural = if minutes > 1 { "s" } else { "" };
            format!("About {minutes} minute{plural}...")
        }
    }
}

struct TrackerState {
    stage_percents: [u8; 3],
    overall: u8,
}

/// Monotonic progress publisher for one run.
///
/// Updates go through a `watch` channel, so a slow subscriber only ever sees
/// the latest value and bursts of completions coalesce.
pub struct ProgressTracker {
    calculator: BootProgressCalculator,
    state: Mutex<TrackerState>,
    sender: watch::Sender<BootProgress>,
}

impl ProgressTracker {
    pub fn new(calculator: BootProgressCalculator) -> Self {
        let (sender, _) = watch::channel(BootProgress::initial());
        Self {
            calculator,
            state: Mutex::new(TrackerState {
                stage_percents: [0; 3],
                overall: 0,
            }),
            sender,
        }
    }

    pub fn calculator(&self) -> &BootProgressCalculator {
        &self.calculator
    }

    pub fn subscribe(&self) -> watch::Receiver<BootProgress> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> BootProgress {
        self.sender.borrow().clone()
    }

    /// Records `completed / total` for `stage` and publishes the result.
    /// Returns the stage percentage actually reported, which never drops
    /// below an earlier report for the same stage.
    pub fn report(&self, stage: BootStage, completed: u32, total: u32, message: &str) -> u8 {
        let raw = BootProgressCalculator::stage_progress(completed, total);
        self.publish(stage, raw, message)
    }

    /// Marks `stage` as fully done.
    pub fn complete_stage(&self, stage: BootStage, message: &str) -> u8 {
        self.publish(stage, 100, message)
    }

    fn publish(&self, stage: BootStage, raw_percent: u8, message: &str) -> u8 {
        let (stage_percent, overall) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = &mut state.stage_percents[stage.number() as usize];
            *slot = (*slot).max(raw_percent.min(100));
            let stage_percent = *slot;
            let overall = self.calculator.overall_progress(state.stage_percents);
            state.overall = state.overall.max(overall);
            (stage_percent, state.overall)
        };

        let next = BootProgress {
            stage_number: stage.number(),
            stage_name: stage.name().to_string(),
            stage_percent,
            overall_percent: overall,
            status_message: message.to_string(),
        };
        self.sender.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        stage_percent
    }
}
