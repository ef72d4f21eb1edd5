use super::memory::PeakMemory;
use super::progress::{BootProgress, BootProgressCalculator, ProgressTracker};
use super::recorder::SessionRecorder;
use super::resolver::ServiceDependencyResolver;
use super::starter::{ParallelServiceStarter, WaveReport};
use super::watchdog::{BootWatchdog, Supervised, TimeoutReport};
use super::ServiceDescriptor;
use crate::config::BootConfig;
use crate::core::{
    BootError, BootSession, BootStage, BootStatus, Criticality, ErrorCategory, Result,
    ServiceRecord, StageOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootState {
    NotStarted,
    Stage0Running,
    Stage1Running,
    Stage2Running,
    Completed { degraded: bool },
    Failed,
    Cancelled,
    TimedOut,
}

impl BootState {
    fn running(stage: BootStage) -> Self {
        match stage {
            BootStage::Bootstrap => BootState::Stage0Running,
            BootStage::Services => BootState::Stage1Running,
            BootStage::ApplicationReady => BootState::Stage2Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BootState::Completed { .. }
                | BootState::Failed
                | BootState::Cancelled
                | BootState::TimedOut
        )
    }
}

enum StagePlan<'a> {
    Sequential(&'a [ServiceDescriptor]),
    Waves(&'a [Vec<ServiceDescriptor>]),
}

impl StagePlan<'_> {
    fn operation_count(&self) -> usize {
        match self {
            StagePlan::Sequential(tasks) => tasks.len(),
            StagePlan::Waves(waves) => waves.iter().map(Vec::len).sum(),
        }
    }
}

enum StageVerdict {
    Completed { degraded: bool },
    Failed,
    Cancelled,
    TimedOut(TimeoutReport),
}

struct RunContext<'a> {
    recorder: &'a SessionRecorder,
    starter: &'a ParallelServiceStarter,
    memory: &'a PeakMemory,
    token: &'a CancellationToken,
}

/// Builder for [`BootOrchestrator`].
#[derive(Default)]
pub struct BootOrchestratorBuilder {
    config: BootConfig,
    bootstrap: Vec<ServiceDescriptor>,
    services: Vec<ServiceDescriptor>,
    ready: Vec<ServiceDescriptor>,
}

impl BootOrchestratorBuilder {
    pub fn config(mut self, config: BootConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a Stage0 task. Stage0 tasks run one after another in the order
    /// they were added.
    pub fn bootstrap_task(mut self, task: ServiceDescriptor) -> Self {
        self.bootstrap.push(task);
        self
    }

    /// Adds a Stage1 service, scheduled by its dependencies.
    pub fn service(mut self, service: ServiceDescriptor) -> Self {
        self.services.push(service);
        self
    }

    pub fn services(mut self, services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        self.services.extend(services);
        self
    }

    /// Adds a Stage2 task. Stage2 tasks run sequentially too.
    pub fn ready_task(mut self, task: ServiceDescriptor) -> Self {
        self.ready.push(task);
        self
    }

    pub fn build(self) -> Result<BootOrchestrator> {
        self.config.validate()?;
        let calculator = BootProgressCalculator::new(self.config.progress.clone());
        Ok(BootOrchestrator {
            config: self.config,
            bootstrap: self.bootstrap,
            services: self.services,
            ready: self.ready,
            progress: ProgressTracker::new(calculator),
            started: AtomicBool::new(false),
            state: Mutex::new(BootState::NotStarted),
            recorder: Mutex::new(None),
        })
    }
}

/// Sequences the three boot stages and owns the session they produce.
pub struct BootOrchestrator {
    config: BootConfig,
    bootstrap: Vec<ServiceDescriptor>,
    services: Vec<ServiceDescriptor>,
    ready: Vec<ServiceDescriptor>,
    progress: ProgressTracker,
    started: AtomicBool,
    state: Mutex<BootState>,
    recorder: Mutex<Option<SessionRecorder>>,
}

impl BootOrchestrator {
    pub fn builder() -> BootOrchestratorBuilder {
        BootOrchestratorBuilder::default()
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Progress stream. Updates coalesce, so a slow reader only ever sees the
    /// latest value.
    pub fn subscribe_progress(&self) -> watch::Receiver<BootProgress> {
        self.progress.subscribe()
    }

    pub fn latest_progress(&self) -> BootProgress {
        self.progress.latest()
    }

    pub fn state(&self) -> BootState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BootState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn recorder(&self) -> Option<SessionRecorder> {
        self.recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consistent copy of the session, also while the run is in progress.
    pub fn session_snapshot(&self) -> Result<BootSession> {
        self.recorder()
            .map(|recorder| recorder.snapshot())
            .ok_or(BootError::NotStarted)
    }

    /// The terminal session of a finished run.
    pub fn session(&self) -> Result<BootSession> {
        let session = self.session_snapshot()?;
        if !session.status.is_terminal() {
            return Err(BootError::InProgress);
        }
        Ok(session)
    }

    /// Runs the whole boot once. Cancelling `token` aborts the run; the
    /// returned session then has status `Cancelled`.
    pub async fn run(&self, token: CancellationToken) -> Result<BootSession> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BootError::AlreadyStarted);
        }

        let session = BootSession::new(self.config.platform.clone(), self.config.app_version.clone());
        let session_id = session.session_id;
        let recorder = SessionRecorder::new(session);
        *self.recorder.lock().unwrap_or_else(PoisonError::into_inner) = Some(recorder.clone());

        let span = info_span!("boot.run", session_id = %session_id);
        Ok(self.run_stages(&recorder, &token).instrument(span).await)
    }

    async fn run_stages(&self, recorder: &SessionRecorder, token: &CancellationToken) -> BootSession {
        let memory = PeakMemory::new();
        memory.sample();
        event!(
            Level::INFO,
            bootstrap = self.bootstrap.len(),
            services = self.services.len(),
            ready = self.ready.len(),
            "boot sequence starting"
        );

        // The dependency graph is checked before anything runs.
        let waves = match self.plan_waves() {
            Ok(waves) => waves,
            Err(err) => {
                event!(Level::ERROR, error = %err, "invalid service graph");
                return self.finish(
                    recorder,
                    &memory,
                    BootState::Failed,
                    BootStatus::Failed,
                    Some((ErrorCategory::Configuration, err.to_string())),
                );
            }
        };

        let starter = ParallelServiceStarter::new(
            recorder.session_id(),
            self.config.watchdog.cancellation_grace(),
        );
        let run = RunContext {
            recorder,
            starter: &starter,
            memory: &memory,
            token,
        };

        let mut degraded = false;
        for stage in BootStage::ALL {
            let plan = match stage {
                BootStage::Bootstrap => StagePlan::Sequential(&self.bootstrap),
                BootStage::Services => StagePlan::Waves(&waves),
                BootStage::ApplicationReady => StagePlan::Sequential(&self.ready),
            };
            self.set_state(BootState::running(stage));

            match self.run_stage(stage, &plan, &run).await {
                StageVerdict::Completed { degraded: stage_degraded } => {
                    degraded |= stage_degraded;
                }
                StageVerdict::Failed => {
                    let error = worst_failure(&recorder.snapshot());
                    return self.finish(recorder, &memory, BootState::Failed, BootStatus::Failed, error);
                }
                StageVerdict::Cancelled => {
                    let message = format!("boot cancelled during {stage}");
                    return self.finish(
                        recorder,
                        &memory,
                        BootState::Cancelled,
                        BootStatus::Cancelled,
                        Some((ErrorCategory::Cancelled, message)),
                    );
                }
                StageVerdict::TimedOut(report) => {
                    return self.finish(
                        recorder,
                        &memory,
                        BootState::TimedOut,
                        BootStatus::Timeout,
                        Some((ErrorCategory::Timeout, report.to_string())),
                    );
                }
            }
        }

        if degraded {
            recorder.mark_degraded();
        }
        self.finish(
            recorder,
            &memory,
            BootState::Completed { degraded },
            BootStatus::Success,
            None,
        )
    }

    fn plan_waves(&self) -> Result<Vec<Vec<ServiceDescriptor>>> {
        let waves = ServiceDependencyResolver::resolve_waves(&self.services)?;
        let by_name: HashMap<&str, &ServiceDescriptor> = self
            .services
            .iter()
            .map(|descriptor| (descriptor.name.as_str(), descriptor))
            .collect();

        Ok(waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .filter_map(|name| by_name.get(name.as_str()).map(|d| (*d).clone()))
                    .collect()
            })
            .collect())
    }

    async fn run_stage(
        &self,
        stage: BootStage,
        plan: &StagePlan<'_>,
        run: &RunContext<'_>,
    ) -> StageVerdict {
        let total = u32::try_from(plan.operation_count()).unwrap_or(u32::MAX);
        let starting = format!("{} starting", stage.name());
        run.recorder.begin_stage(stage, total);
        self.progress.report(stage, 0, total, &starting);
        run.memory.sample();

        let stage_token = run.token.child_token();
        let stage_started = Instant::now();
        let mut completed = 0u32;

        let mut on_complete = |record: &ServiceRecord| {
            completed += 1;
            let message = if record.success {
                format!("{} ready", record.service_name)
            } else {
                format!("{} failed", record.service_name)
            };
            let percent = self.progress.report(stage, completed, total, &message);
            run.recorder.append_service(record.clone());
            run.recorder.update_stage(stage, completed, percent, &message);
        };

        let work = async {
            match plan {
                StagePlan::Sequential(tasks) => {
                    run.starter
                        .start_sequentially(stage, tasks, &stage_token, stage_started, &mut on_complete)
                        .await
                }
                StagePlan::Waves(waves) => {
                    let mut report = WaveReport::default();
                    for (index, wave) in waves.iter().enumerate() {
                        if stage_token.is_cancelled() {
                            break;
                        }
                        let wave_report = run
                            .starter
                            .start_wave(stage, Some(index), wave, &stage_token, stage_started, &mut on_complete)
                            .await;
                        let abort = wave_report.should_abort();
                        report.merge(wave_report);
                        if abort {
                            event!(Level::WARN, wave = index, "required service failed, not starting later waves");
                            break;
                        }
                    }
                    report
                }
            }
        };

        let watchdog = BootWatchdog::new(stage, self.config.watchdog.deadline_for(stage))
            .with_memory(run.memory);
        let span = info_span!("boot.stage", stage = stage.number(), stage_name = stage.name());
        let (report, timeout) = match watchdog.supervise(&stage_token, work).instrument(span).await {
            Supervised::Completed(report) => (report, None),
            Supervised::TimedOut { report: timeout, output } => (output, Some(timeout)),
        };

        let verdict = classify(&report, timeout, run.token.is_cancelled());
        let (outcome, message) = match &verdict {
            StageVerdict::Completed { degraded: false } => {
                (StageOutcome::Completed, format!("{} completed", stage.name()))
            }
            StageVerdict::Completed { degraded: true } => {
                let failed: Vec<&str> = report.failed().map(|r| r.service_name.as_str()).collect();
                (
                    StageOutcome::CompletedDegraded,
                    format!(
                        "{} completed with degradation ({} unavailable)",
                        stage.name(),
                        failed.join(", ")
                    ),
                )
            }
            StageVerdict::Failed => {
                let failed: Vec<&str> = report.failed().map(|r| r.service_name.as_str()).collect();
                (
                    StageOutcome::Failed,
                    format!("{} failed ({})", stage.name(), failed.join(", ")),
                )
            }
            StageVerdict::Cancelled => (StageOutcome::Cancelled, format!("{} cancelled", stage.name())),
            StageVerdict::TimedOut(timeout) => (StageOutcome::Timeout, timeout.to_string()),
        };

        if outcome.is_success() {
            self.progress.complete_stage(stage, &message);
        }
        run.recorder.seal_stage(stage, outcome, &message);
        run.memory.sample();
        event!(Level::INFO, stage = stage.number(), outcome = ?outcome, message = %message, "stage sealed");
        verdict
    }

    fn finish(
        &self,
        recorder: &SessionRecorder,
        memory: &PeakMemory,
        state: BootState,
        status: BootStatus,
        error: Option<(ErrorCategory, String)>,
    ) -> BootSession {
        memory.sample();
        recorder.record_peak_memory(memory.peak());
        let session = recorder.finish(status, error);
        self.set_state(state);
        event!(
            Level::INFO,
            status = ?session.status,
            degraded = session.degraded,
            duration_ms = session.total_duration_ms.unwrap_or(0),
            "boot sequence finished"
        );
        session
    }
}

fn classify(report: &WaveReport, timeout: Option<TimeoutReport>, externally_cancelled: bool) -> StageVerdict {
    // A real failure outranks the cancellation it may have been followed by.
    let hard_failure = report.failed().any(|record| {
        let category = record.error_category.unwrap_or(ErrorCategory::Permanent);
        category.is_boot_fatal()
            || (record.criticality == Criticality::Required && category != ErrorCategory::Cancelled)
    });

    if hard_failure {
        StageVerdict::Failed
    } else if externally_cancelled {
        StageVerdict::Cancelled
    } else if let Some(timeout) = timeout {
        StageVerdict::TimedOut(timeout)
    } else if report.required_failed {
        StageVerdict::Failed
    } else {
        StageVerdict::Completed {
            degraded: report.degraded,
        }
    }
}

/// Most severe recorded failure; the earliest one wins a tie.
fn worst_failure(session: &BootSession) -> Option<(ErrorCategory, String)> {
    session
        .failed_services()
        .reduce(|worst, record| {
            if severity(record) > severity(worst) {
                record
            } else {
                worst
            }
        })
        .map(|record| {
            let category = record.error_category.unwrap_or(ErrorCategory::Permanent);
            let message = format!(
                "{}: {}",
                record.service_name,
                record.error_message.as_deref().unwrap_or("failed")
            );
            (category, message)
        })
}

fn severity(record: &ServiceRecord) -> crate::core::ErrorSeverity {
    record
        .error_category
        .unwrap_or(ErrorCategory::Permanent)
        .severity()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InitError;

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let orchestrator = BootOrchestrator::builder().build().unwrap();
        assert!(matches!(orchestrator.session(), Err(BootError::NotStarted)));

        let session = orchestrator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(session.status, BootStatus::Success);
        assert_eq!(session.stages.len(), 3);
        assert_eq!(orchestrator.state(), BootState::Completed { degraded: false });
        assert_eq!(orchestrator.latest_progress().overall_percent, 100);

        let again = orchestrator.run(CancellationToken::new()).await;
        assert!(matches!(again, Err(BootError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_worst_failure_prefers_higher_severity() {
        let orchestrator = BootOrchestrator::builder()
            .service(
                ServiceDescriptor::from_fn("a_optional", |_| async {
                    Err(InitError::transient("flaky"))
                })
                .optional(),
            )
            .service(ServiceDescriptor::from_fn("b_required", |_| async {
                Err(InitError::storage("disk full"))
            }))
            .build()
            .unwrap();

        let session = orchestrator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(session.status, BootStatus::Failed);
        assert_eq!(session.error_category, Some(ErrorCategory::Storage));
        assert_eq!(session.error_message.as_deref(), Some("b_required: disk full"));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_build() {
        let mut config = BootConfig::default();
        config.watchdog.stage1_deadline_ms = 0;
        assert!(BootOrchestrator::builder().config(config).build().is_err());
    }
}
