pub mod descriptor;
pub mod export;
pub mod memory;
pub mod orchestrator;
pub mod periodic;
pub mod progress;
pub mod recorder;
pub mod resolver;
pub mod starter;
pub mod watchdog;

pub use descriptor::{FnInitializer, ServiceDescriptor, ServiceInitializer};
pub use export::{BootTimeline, DiagnosticExport, TimelineEntry};
pub use memory::PeakMemory;
pub use orchestrator::{BootOrchestrator, BootOrchestratorBuilder, BootState};
pub use periodic::PeriodicTask;
pub use progress::{BootProgress, BootProgressCalculator, ProgressTracker};
pub use recorder::SessionRecorder;
pub use resolver::ServiceDependencyResolver;
pub use starter::{ParallelServiceStarter, WaveReport};
pub use watchdog::{BootWatchdog, Supervised, TimeoutReport};
