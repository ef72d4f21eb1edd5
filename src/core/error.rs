use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("Dependency cycle detected among services: {}", services.join(", "))]
    DependencyCycle { services: Vec<String> },

    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Boot sequence has already been started")]
    AlreadyStarted,

    #[error("Boot sequence has not been started yet")]
    NotStarted,

    #[error("Boot sequence is still running")]
    InProgress,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, BootError>;

impl<T> From<std::sync::PoisonError<T>> for BootError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for BootError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BootError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Classification applied to any failure crossing a service init boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network hiccups and timeouts; retried with backoff.
    Transient,
    /// Missing or invalid settings.
    Configuration,
    /// Access denied.
    Permission,
    /// Disk or space problems.
    Storage,
    /// Out of memory and similar exhaustion. Boot-fatal.
    Resource,
    /// Bugs: panics, broken invariants. Boot-fatal.
    Programming,
    /// Anything uncategorized.
    Permanent,
    /// The init observed cancellation before finishing.
    Cancelled,
    /// A stage deadline expired.
    Timeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Advisory follow-up recorded next to a failure. Nothing here is executed
/// by the orchestrator itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    UseDefaults,
    PromptUser,
    CheckStorage,
    RestartApplication,
    ReportAndContinue,
}

impl ErrorCategory {
    pub fn severity(self) -> ErrorSeverity {
        match self {
            ErrorCategory::Cancelled => ErrorSeverity::Low,
            ErrorCategory::Transient | ErrorCategory::Timeout => ErrorSeverity::Medium,
            ErrorCategory::Configuration
            | ErrorCategory::Permission
            | ErrorCategory::Storage
            | ErrorCategory::Permanent => ErrorSeverity::High,
            ErrorCategory::Resource | ErrorCategory::Programming => ErrorSeverity::Critical,
        }
    }

    pub fn is_transient(self) -> bool {
        self == ErrorCategory::Transient
    }

    /// Failures that force `Failed` regardless of the service's criticality.
    pub fn is_boot_fatal(self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    pub fn recovery_action(self) -> RecoveryAction {
        match self {
            ErrorCategory::Transient | ErrorCategory::Timeout => RecoveryAction::Retry,
            ErrorCategory::Configuration => RecoveryAction::UseDefaults,
            ErrorCategory::Permission => RecoveryAction::PromptUser,
            ErrorCategory::Storage => RecoveryAction::CheckStorage,
            ErrorCategory::Resource | ErrorCategory::Programming => {
                RecoveryAction::RestartApplication
            }
            ErrorCategory::Permanent | ErrorCategory::Cancelled => {
                RecoveryAction::ReportAndContinue
            }
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Programming => "programming",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Failure reported by a service initializer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category} error: {message}")]
pub struct InitError {
    pub category: ErrorCategory,
    pub message: String,
}

impl InitError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Storage, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Resource, message)
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Programming, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Cancelled, message)
    }

    pub fn is_transient(&self) -> bool {
        self.category.is_transient()
    }
}

impl From<std::io::Error> for InitError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let category = match err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock => ErrorCategory::Transient,
            ErrorKind::PermissionDenied => ErrorCategory::Permission,
            ErrorKind::OutOfMemory => ErrorCategory::Resource,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorCategory::Configuration,
            _ => ErrorCategory::Storage,
        };
        Self::new(category, err.to_string())
    }
}
