pub mod error;
pub mod types;

pub use error::{BootError, ErrorCategory, ErrorSeverity, InitError, RecoveryAction, Result};
pub use types::{
    BootSession, BootStage, BootStatus, Criticality, ServiceRecord, SessionId, StageOutcome,
    StageRecord,
};
