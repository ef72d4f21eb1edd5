// ============================================================================
// bootseq Library
// ============================================================================

//! Staged application boot with dependency-ordered parallel service
//! startup, per-stage deadlines, circuit breaking with backoff, and a full
//! telemetry record of every run.
//!
//! ```
//! use bootseq::{BootConfig, BootOrchestrator, BootStatus, InitError, ServiceDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = BootOrchestrator::builder()
//!     .config(BootConfig::new().platform("docs"))
//!     .service(ServiceDescriptor::from_fn("config", |_| async { Ok(()) }))
//!     .service(
//!         ServiceDescriptor::from_fn("database", |_| async { Ok::<(), InitError>(()) })
//!             .depends_on("config"),
//!     )
//!     .build()?;
//!
//! let session = orchestrator.run(CancellationToken::new()).await?;
//! assert_eq!(session.status, BootStatus::Success);
//! # Ok(())
//! # }
//! ```

pub mod boot;
pub mod config;
pub mod core;
pub mod resilience;

// Re-export main types for convenience
pub use crate::core::{
    BootError, BootSession, BootStage, BootStatus, Criticality, ErrorCategory, ErrorSeverity,
    InitError, RecoveryAction, Result, ServiceRecord, SessionId, StageOutcome, StageRecord,
};
pub use crate::config::{
    BackoffPolicy, BootConfig, BreakerMode, BreakerPolicy, ProgressWeights, WatchdogPolicy,
};

// Re-export orchestration API
pub use crate::boot::{
    BootOrchestrator, BootOrchestratorBuilder, BootProgress, BootProgressCalculator, BootState,
    BootTimeline, BootWatchdog, DiagnosticExport, ParallelServiceStarter, PeriodicTask,
    ServiceDependencyResolver, ServiceDescriptor, ServiceInitializer, TimeoutReport, WaveReport,
};
pub use crate::resilience::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
    ExponentialBackoff, ResilienceError, ResiliencePolicy, Transient,
};
