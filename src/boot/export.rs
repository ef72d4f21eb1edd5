use crate::core::{BootSession, BootStatus, Result, SessionId};
use crate::resilience::CircuitBreakerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub name: String,
    pub stage_number: u8,
    pub wave: Option<usize>,
    /// Start relative to the session start.
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub success: bool,
}

/// Stage and service spans laid out against the session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootTimeline {
    pub session_id: SessionId,
    pub status: BootStatus,
    pub total_duration_ms: Option<u64>,
    pub stages: Vec<TimelineEntry>,
    pub services: Vec<TimelineEntry>,
    pub slowest_service: Option<String>,
}

impl BootTimeline {
    pub fn from_session(session: &BootSession) -> Self {
        let origin = session.start_timestamp;

        let stages = session
            .stages
            .iter()
            .map(|stage| TimelineEntry {
                name: stage.stage_name.clone(),
                stage_number: stage.stage_number,
                wave: None,
                offset_ms: offset_ms(origin, stage.start_timestamp),
                duration_ms: stage.duration_ms.unwrap_or(0),
                success: stage.outcome.is_success(),
            })
            .collect();

        let mut services: Vec<TimelineEntry> = session
            .services
            .iter()
            .map(|service| TimelineEntry {
                name: service.service_name.clone(),
                stage_number: service.stage_number,
                wave: service.wave,
                offset_ms: offset_ms(origin, service.start_timestamp),
                duration_ms: service.duration_ms,
                success: service.success,
            })
            .collect();
        services.sort_by(|a, b| {
            a.offset_ms
                .cmp(&b.offset_ms)
                .then_with(|| a.name.cmp(&b.name))
        });

        let slowest_service = session
            .services
            .iter()
            .max_by_key(|service| service.duration_ms)
            .map(|service| service.service_name.clone());

        Self {
            session_id: session.session_id,
            status: session.status,
            total_duration_ms: session.total_duration_ms,
            stages,
            services,
            slowest_service,
        }
    }
}

fn offset_ms(origin: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    (at - origin).num_milliseconds().max(0) as u64
}

/// Everything needed to diagnose a boot after the fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticExport {
    pub exported_at: DateTime<Utc>,
    pub session: BootSession,
    pub timeline: BootTimeline,
    pub circuit_breakers: Vec<CircuitBreakerState>,
}

impl DiagnosticExport {
    pub fn new(session: BootSession, circuit_breakers: Vec<CircuitBreakerState>) -> Self {
        let timeline = BootTimeline::from_session(&session);
        Self {
            exported_at: Utc::now(),
            session,
            timeline,
            circuit_breakers,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }
}
