use super::{ErrorCategory, RecoveryAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Terminal (or in-flight) status of a boot session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootStatus {
    InProgress,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl BootStatus {
    pub fn is_terminal(self) -> bool {
        self != BootStatus::InProgress
    }
}

/// The three ordered startup phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootStage {
    Bootstrap,
    Services,
    ApplicationReady,
}

impl BootStage {
    pub const ALL: [BootStage; 3] = [
        BootStage::Bootstrap,
        BootStage::Services,
        BootStage::ApplicationReady,
    ];

    pub fn number(self) -> u8 {
        match self {
            BootStage::Bootstrap => 0,
            BootStage::Services => 1,
            BootStage::ApplicationReady => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BootStage::Bootstrap => "Bootstrap",
            BootStage::Services => "Services",
            BootStage::ApplicationReady => "ApplicationReady",
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.number() == number)
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage {} ({})", self.number(), self.name())
    }
}

/// How a stage ended. `Running` until the record is sealed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageOutcome {
    Running,
    Completed,
    CompletedDegraded,
    Failed,
    Timeout,
    Cancelled,
}

impl StageOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, StageOutcome::Completed | StageOutcome::CompletedDegraded)
    }
}

/// Whether a service's failure must abort the boot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Criticality {
    #[default]
    Required,
    Optional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub stage_number: u8,
    pub stage_name: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// 0..=100, never decreases while the stage runs.
    pub progress_percentage: u8,
    pub status_message: String,
    pub operations_completed: u32,
    pub operations_total: u32,
    pub outcome: StageOutcome,
}

impl StageRecord {
    pub fn begin(stage: BootStage, operations_total: u32) -> Self {
        Self {
            stage_number: stage.number(),
            stage_name: stage.name().to_string(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            duration_ms: None,
            progress_percentage: 0,
            status_message: format!("{} starting", stage.name()),
            operations_completed: 0,
            operations_total,
            outcome: StageOutcome::Running,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.outcome != StageOutcome::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub service_name: String,
    pub session_id: SessionId,
    pub stage_number: u8,
    /// Wave index inside the services stage; `None` for bootstrap/ready tasks.
    pub wave: Option<usize>,
    pub criticality: Criticality,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub recovery_action: Option<RecoveryAction>,
    /// Time between the stage start and this service's own start.
    pub dependencies_wait_ms: u64,
}

impl ServiceRecord {
    pub fn is_cancelled(&self) -> bool {
        self.error_category == Some(ErrorCategory::Cancelled)
    }
}

/// Telemetry for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootSession {
    pub session_id: SessionId,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub status: BootStatus,
    /// Set when an optional service failed but the boot went on.
    pub degraded: bool,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub stages: Vec<StageRecord>,
    pub services: Vec<ServiceRecord>,
    pub peak_memory_bytes: Option<u64>,
    pub platform: String,
    pub app_version: String,
}

impl BootSession {
    pub fn new(platform: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            total_duration_ms: None,
            status: BootStatus::InProgress,
            degraded: false,
            error_category: None,
            error_message: None,
            stages: Vec::new(),
            services: Vec::new(),
            peak_memory_bytes: None,
            platform: platform.into(),
            app_version: app_version.into(),
        }
    }

    pub fn stage(&self, stage: BootStage) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|record| record.stage_number == stage.number())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services
            .iter()
            .find(|record| record.service_name == name)
    }

    pub fn failed_services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.iter().filter(|record| !record.success)
    }

    pub fn is_success(&self) -> bool {
        self.status == BootStatus::Success
    }
}
