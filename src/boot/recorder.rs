use crate::core::{
    BootSession, BootStage, BootStatus, ErrorCategory, ServiceRecord, SessionId, StageOutcome,
    StageRecord,
};
use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared, append-only view of the session being built.
///
/// Stage and service records are appended once; a sealed stage record and a
/// terminal session are never modified again.
#[derive(Clone)]
pub struct SessionRecorder {
    session: Arc<RwLock<BootSession>>,
}

impl SessionRecorder {
    pub fn new(session: BootSession) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BootSession> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BootSession> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> SessionId {
        self.read().session_id
    }

    pub fn snapshot(&self) -> BootSession {
        self.read().clone()
    }

    pub fn status(&self) -> BootStatus {
        self.read().status
    }

    pub fn begin_stage(&self, stage: BootStage, operations_total: u32) {
        let mut session = self.write();
        if session.status.is_terminal() || session.stage(stage).is_some() {
            return;
        }
        session.stages.push(StageRecord::begin(stage, operations_total));
    }

    /// Updates a running stage. Progress only moves forward.
    pub fn update_stage(&self, stage: BootStage, operations_completed: u32, progress: u8, message: &str) {
        let mut session = self.write();
        if let Some(record) = running_stage(&mut session, stage) {
            record.operations_completed = record.operations_completed.max(operations_completed);
            record.progress_percentage = record.progress_percentage.max(progress.min(100));
            record.status_message = message.to_string();
        }
    }

    pub fn seal_stage(&self, stage: BootStage, outcome: StageOutcome, message: &str) {
        let mut session = self.write();
        if let Some(record) = running_stage(&mut session, stage) {
            let end = Utc::now();
            record.duration_ms = Some(
                (end - record.start_timestamp)
                    .num_milliseconds()
                    .max(0) as u64,
            );
            record.end_timestamp = Some(end);
            record.outcome = if outcome == StageOutcome::Running {
                StageOutcome::Completed
            } else {
                outcome
            };
            if outcome.is_success() {
                record.progress_percentage = 100;
            }
            record.status_message = message.to_string();
        }
    }

    pub fn append_service(&self, record: ServiceRecord) {
        let mut session = self.write();
        if session.status.is_terminal() {
            return;
        }
        session.services.push(record);
    }

    pub fn mark_degraded(&self) {
        let mut session = self.write();
        if !session.status.is_terminal() {
            session.degraded = true;
        }
    }

    pub fn record_peak_memory(&self, peak: Option<u64>) {
        let mut session = self.write();
        if let Some(bytes) = peak {
            session.peak_memory_bytes = Some(session.peak_memory_bytes.unwrap_or(0).max(bytes));
        }
    }

    /// Moves the session to its terminal status. Later calls are ignored.
    pub fn finish(&self, status: BootStatus, error: Option<(ErrorCategory, String)>) -> BootSession {
        let mut session = self.write();
        if session.status.is_terminal() || status == BootStatus::InProgress {
            return session.clone();
        }

        let end = Utc::now();
        session.total_duration_ms = Some(
            (end - session.start_timestamp)
                .num_milliseconds()
                .max(0) as u64,
        );
        session.end_timestamp = Some(end);
        session.status = status;
        if let Some((category, message)) = error {
            session.error_category = Some(category);
            session.error_message = Some(message);
        }
        session.clone()
    }
}

fn running_stage(session: &mut BootSession, stage: BootStage) -> Option<&mut StageRecord> {
    if session.status.is_terminal() {
        return None;
    }
    session
        .stages
        .iter_mut()
        .find(|record| record.stage_number == stage.number() && !record.is_sealed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_stage_is_frozen() {
        let recorder = SessionRecorder::new(BootSession::new("linux", "1.0.0"));
        recorder.begin_stage(BootStage::Bootstrap, 2);
        recorder.update_stage(BootStage::Bootstrap, 1, 50, "half way");
        recorder.seal_stage(BootStage::Bootstrap, StageOutcome::Completed, "done");
        recorder.update_stage(BootStage::Bootstrap, 0, 10, "late update");

        let session = recorder.snapshot();
        let stage = session.stage(BootStage::Bootstrap).unwrap();
        assert_eq!(stage.progress_percentage, 100);
        assert_eq!(stage.status_message, "done");
        assert!(stage.is_sealed());
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_progress_never_moves_back() {
        let recorder = SessionRecorder::new(BootSession::new("linux", "1.0.0"));
        recorder.begin_stage(BootStage::Services, 4);
        recorder.update_stage(BootStage::Services, 3, 75, "three");
        recorder.update_stage(BootStage::Services, 2, 50, "two");

        let session = recorder.snapshot();
        let stage = session.stage(BootStage::Services).unwrap();
        assert_eq!(stage.progress_percentage, 75);
        assert_eq!(stage.operations_completed, 3);
    }

    #[test]
    fn test_finish_is_once_only() {
        let recorder = SessionRecorder::new(BootSession::new("linux", "1.0.0"));
        let first = recorder.finish(
            BootStatus::Failed,
            Some((ErrorCategory::Storage, "disk full".to_string())),
        );
        let second = recorder.finish(BootStatus::Success, None);

        assert_eq!(first.status, BootStatus::Failed);
        assert_eq!(second.status, BootStatus::Failed);
        assert_eq!(second.error_category, Some(ErrorCategory::Storage));
        assert!(second.end_timestamp.is_some());
    }
}
