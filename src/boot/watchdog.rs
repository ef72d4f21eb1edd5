use super::memory::PeakMemory;
use crate::core::BootStage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// What the watchdog saw when a stage overran its budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutReport {
    pub stage: BootStage,
    pub budget: Duration,
    /// Time from arming to the moment the stage actually wound down after
    /// cancellation.
    pub elapsed: Duration,
    /// Resident memory when the deadline fired.
    pub memory_bytes: Option<u64>,
    /// Tokio worker threads driving the stage when the deadline fired.
    pub runtime_workers: usize,
}

impl fmt::Display for TimeoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceeded its {} ms budget (stopped after {} ms",
            self.stage,
            self.budget.as_millis(),
            self.elapsed.as_millis()
        )?;
        if let Some(bytes) = self.memory_bytes {
            write!(f, ", resident {} MiB", bytes / (1024 * 1024))?;
        }
        write!(f, ", {} runtime workers)", self.runtime_workers)
    }
}

#[derive(Debug)]
pub enum Supervised<T> {
    Completed(T),
    /// The deadline fired first. The stage's token was cancelled and the
    /// stage future was still driven to completion so its records stay
    /// accurate; its output is carried along.
    TimedOut { report: TimeoutReport, output: T },
}

impl<T> Supervised<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Supervised::TimedOut { .. })
    }

    pub fn into_output(self) -> T {
        match self {
            Supervised::Completed(output) => output,
            Supervised::TimedOut { output, .. } => output,
        }
    }
}

/// Deadline supervisor with one lifetime per stage.
pub struct BootWatchdog<'a> {
    stage: BootStage,
    budget: Duration,
    memory: Option<&'a PeakMemory>,
}

impl<'a> BootWatchdog<'a> {
    pub fn new(stage: BootStage, budget: Duration) -> Self {
        Self {
            stage,
            budget,
            memory: None,
        }
    }

    /// Samples `memory` when the deadline fires, for the timeout report.
    pub fn with_memory(mut self, memory: &'a PeakMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Drives `stage_future` against the budget. On expiry `stage_token` is
    /// cancelled and the future is awaited until it observes that.
    ///
    /// Consumes the watchdog, so it cannot be re-armed.
    pub async fn supervise<F>(self, stage_token: &CancellationToken, stage_future: F) -> Supervised<F::Output>
    where
        F: Future,
    {
        let armed_at = Instant::now();
        let deadline = sleep(self.budget);
        tokio::pin!(deadline);
        tokio::pin!(stage_future);

        tokio::select! {
            biased;
            output = &mut stage_future => {
                event!(
                    Level::DEBUG,
                    stage = self.stage.number(),
                    elapsed_ms = armed_at.elapsed().as_millis() as u64,
                    "stage finished within budget"
                );
                return Supervised::Completed(output);
            }
            _ = &mut deadline => {}
        }

        let memory_bytes = self.memory.and_then(PeakMemory::sample);
        let runtime_workers = Handle::try_current()
            .map(|handle| handle.metrics().num_workers())
            .unwrap_or(0);
        event!(
            Level::WARN,
            stage = self.stage.number(),
            budget_ms = self.budget.as_millis() as u64,
            memory_bytes = memory_bytes,
            runtime_workers = runtime_workers,
            "stage deadline expired, cancelling"
        );
        stage_token.cancel();

        let output = stage_future.await;
        let report = TimeoutReport {
            stage: self.stage,
            budget: self.budget,
            elapsed: armed_at.elapsed(),
            memory_bytes,
            runtime_workers,
        };
        event!(Level::WARN, report = %report, "stage timed out");
        Supervised::TimedOut { report, output }
    }
}
