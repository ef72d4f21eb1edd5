use super::ServiceDescriptor;
use crate::core::{
    BootStage, Criticality, ErrorCategory, InitError, ServiceRecord, SessionId,
};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Aggregated outcome of one batch of service inits.
#[derive(Debug, Clone, Default)]
pub struct WaveReport {
    /// In completion order.
    pub records: Vec<ServiceRecord>,
    /// A required service failed or was cancelled.
    pub required_failed: bool,
    /// Some failure was boot-fatal regardless of criticality.
    pub fatal: bool,
    /// An optional service failed.
    pub degraded: bool,
    pub cancelled: bool,
}

impl WaveReport {
    fn push(&mut self, record: ServiceRecord) {
        if !record.success {
            let category = record.error_category.unwrap_or(ErrorCategory::Permanent);
            if category.is_boot_fatal() {
                self.fatal = true;
            }
            if category == ErrorCategory::Cancelled {
                self.cancelled = true;
            }
            match record.criticality {
                Criticality::Required => self.required_failed = true,
                Criticality::Optional => self.degraded = true,
            }
        }
        self.records.push(record);
    }

    /// Whether the stage must stop advancing.
    pub fn should_abort(&self) -> bool {
        self.required_failed || self.fatal
    }

    pub fn failed(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.iter().filter(|record| !record.success)
    }

    pub fn merge(&mut self, other: WaveReport) {
        for record in other.records {
            self.push(record);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ServiceContext {
    session_id: SessionId,
    stage: BootStage,
    wave: Option<usize>,
    stage_started: Instant,
    grace: Duration,
}

/// Runs service initializers and turns every outcome into a `ServiceRecord`.
#[derive(Debug, Clone)]
pub struct ParallelServiceStarter {
    session_id: SessionId,
    cancellation_grace: Duration,
}

impl ParallelServiceStarter {
    pub fn new(session_id: SessionId, cancellation_grace: Duration) -> Self {
        Self {
            session_id,
            cancellation_grace,
        }
    }

    /// Starts every service of `wave` at once and waits until each one has
    /// succeeded, failed or been cancelled.
    ///
    /// A required failure does not interrupt siblings; they run to their own
    /// end so their records stay accurate. `on_complete` sees each record as
    /// soon as it exists.
    pub async fn start_wave<C>(
        &self,
        stage: BootStage,
        wave_index: Option<usize>,
        wave: &[ServiceDescriptor],
        token: &CancellationToken,
        stage_started: Instant,
        mut on_complete: C,
    ) -> WaveReport
    where
        C: FnMut(&ServiceRecord),
    {
        let ctx = ServiceContext {
            session_id: self.session_id,
            stage,
            wave: wave_index,
            stage_started,
            grace: self.cancellation_grace,
        };

        event!(
            Level::INFO,
            stage = stage.number(),
            wave = ?wave_index,
            services = wave.len(),
            "starting wave"
        );

        let mut tasks = JoinSet::new();
        for descriptor in wave {
            let descriptor = descriptor.clone();
            let token = token.clone();
            let span = info_span!("boot.service", service = %descriptor.name, wave = ?wave_index);
            tasks.spawn(run_service(descriptor, token, ctx).instrument(span));
        }

        let mut report = WaveReport::default();
        let mut reported = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => {
                    reported.insert(record.service_name.clone());
                    on_complete(&record);
                    report.push(record);
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "service task did not report");
                }
            }
        }

        // A task that died without a record still needs one.
        for descriptor in wave {
            if reported.contains(&descriptor.name) {
                continue;
            }
            let err = InitError::programming("initialization task ended without reporting");
            let now = Instant::now();
            let record = build_record(&descriptor.name, descriptor.criticality, &ctx, Utc::now(), now, now, Err(err));
            on_complete(&record);
            report.push(record);
        }

        report
    }

    /// Starts services one at a time in the given order. Stops after the
    /// first required or fatal failure, or once `token` is cancelled;
    /// services after that point are never started.
    pub async fn start_sequentially<C>(
        &self,
        stage: BootStage,
        services: &[ServiceDescriptor],
        token: &CancellationToken,
        stage_started: Instant,
        mut on_complete: C,
    ) -> WaveReport
    where
        C: FnMut(&ServiceRecord),
    {
        let ctx = ServiceContext {
            session_id: self.session_id,
            stage,
            wave: None,
            stage_started,
            grace: self.cancellation_grace,
        };

        let mut report = WaveReport::default();
        for descriptor in services {
            if token.is_cancelled() {
                break;
            }
            let span = info_span!("boot.service", service = %descriptor.name);
            let record = run_service(descriptor.clone(), token.clone(), ctx)
                .instrument(span)
                .await;
            on_complete(&record);

            let mut single = WaveReport::default();
            single.push(record);
            let abort = single.should_abort();
            report.merge(single);
            if abort {
                break;
            }
        }
        report
    }
}

async fn run_service(
    descriptor: ServiceDescriptor,
    token: CancellationToken,
    ctx: ServiceContext,
) -> ServiceRecord {
    let start_timestamp = Utc::now();
    let started = Instant::now();

    let outcome = if token.is_cancelled() {
        Err(InitError::cancelled("cancelled before start"))
    } else {
        supervise_init(&descriptor, &token, ctx.grace).await
    };

    let record = build_record(
        &descriptor.name,
        descriptor.criticality,
        &ctx,
        start_timestamp,
        started,
        Instant::now(),
        outcome,
    );

    if record.success {
        event!(
            Level::INFO,
            duration_ms = record.duration_ms,
            wait_ms = record.dependencies_wait_ms,
            "service initialized"
        );
    } else {
        event!(
            Level::WARN,
            duration_ms = record.duration_ms,
            category = ?record.error_category,
            error = record.error_message.as_deref().unwrap_or_default(),
            "service failed"
        );
    }
    record
}

/// Runs one init, turning panics into `Programming` failures. Once `token`
/// is cancelled the init gets `grace` to wind down before it is dropped.
async fn supervise_init(
    descriptor: &ServiceDescriptor,
    token: &CancellationToken,
    grace: Duration,
) -> Result<(), InitError> {
    let init = AssertUnwindSafe(descriptor.initializer.initialize(token.child_token()))
        .catch_unwind()
        .map(flatten_panic);
    tokio::pin!(init);

    let result = tokio::select! {
        biased;
        result = &mut init => result,
        _ = token.cancelled() => {
            tokio::select! {
                biased;
                result = &mut init => result,
                _ = sleep(grace) => Err(InitError::cancelled(format!(
                    "did not stop within {} ms of cancellation",
                    grace.as_millis()
                ))),
            }
        }
    };

    // Anything that went wrong after cancellation is reported as cancellation.
    match result {
        Err(err) if token.is_cancelled() && err.category != ErrorCategory::Cancelled => {
            Err(InitError::cancelled(format!("cancelled: {}", err.message)))
        }
        other => other,
    }
}

fn flatten_panic(result: Result<Result<(), InitError>, Box<dyn Any + Send>>) -> Result<(), InitError> {
    match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(InitError::programming(format!("initializer panicked: {detail}")))
        }
    }
}

fn build_record(
    name: &str,
    criticality: Criticality,
    ctx: &ServiceContext,
    start_timestamp: chrono::DateTime<Utc>,
    started: Instant,
    finished: Instant,
    outcome: Result<(), InitError>,
) -> ServiceRecord {
    let (success, error_category, error_message) = match outcome {
        Ok(()) => (true, None, None),
        Err(err) => (false, Some(err.category), Some(err.message)),
    };

    ServiceRecord {
        service_name: name.to_string(),
        session_id: ctx.session_id,
        stage_number: ctx.stage.number(),
        wave: ctx.wave,
        criticality,
        start_timestamp,
        end_timestamp: Utc::now(),
        duration_ms: finished.saturating_duration_since(started).as_millis() as u64,
        success,
        error_category,
        error_message,
        recovery_action: error_category.map(ErrorCategory::recovery_action),
        dependencies_wait_ms: started.saturating_duration_since(ctx.stage_started).as_millis() as u64,
    }
}
