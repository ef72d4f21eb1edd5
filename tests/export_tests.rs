/// Configuration and diagnostic export tests
///
/// Loading a partial JSON config from disk, and writing/reading a full
/// diagnostic bundle after a run.
/// Run with: cargo test --test export_tests

use bootseq::{
    BootConfig, BootError, BootOrchestrator, BreakerMode, CircuitBreakerRegistry, CircuitState,
    DiagnosticExport, InitError, ServiceDescriptor,
};
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

#[test]
fn test_partial_config_file_keeps_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "watchdog": {{ "stage1_deadline_ms": 8000 }},
            "breaker": {{ "mode": "ConsecutiveFailures" }},
            "platform": "kiosk"
        }}"#
    )
    .unwrap();

    let config = BootConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.watchdog.stage1_deadline_ms, 8_000);
    assert_eq!(config.watchdog.stage0_deadline_ms, 1_000);
    assert_eq!(config.breaker.mode, BreakerMode::ConsecutiveFailures);
    assert_eq!(config.breaker.recovery_delays_ms.len(), 5);
    assert_eq!(config.backoff.delays_ms, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    assert_eq!(config.platform, "kiosk");
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "backoff": {{ "jitter_factor": 1.5 }} }}"#).unwrap();
    assert!(matches!(
        BootConfig::from_json_file(file.path()),
        Err(BootError::InvalidConfig(_))
    ));

    let missing = BootConfig::from_json_file("/definitely/not/here.json");
    assert!(matches!(missing, Err(BootError::Io(_))));
}

#[tokio::test]
async fn test_export_round_trips_through_disk() {
    let registry = CircuitBreakerRegistry::default();
    registry.get("database");
    for _ in 0..5 {
        registry.get("remote_api").try_acquire().unwrap().failure();
    }

    let orchestrator = BootOrchestrator::builder()
        .config(BootConfig::new().platform("ci").app_version("2.1.0"))
        .bootstrap_task(ServiceDescriptor::from_fn("configuration", |_| async { Ok(()) }))
        .service(ServiceDescriptor::from_fn("database", |_| async { Ok(()) }))
        .service(
            ServiceDescriptor::from_fn("remote_api", |_| async {
                Err(InitError::transient("circuit open"))
            })
            .optional(),
        )
        .ready_task(ServiceDescriptor::from_fn("navigation", |_| async { Ok(()) }))
        .build()
        .unwrap();
    let session = orchestrator.run(CancellationToken::new()).await.unwrap();

    let export = DiagnosticExport::new(session.clone(), registry.snapshot());
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("boot-diagnostics.json");
    export.write_to_file(&path).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let restored = DiagnosticExport::from_json(&raw).unwrap();
    assert_eq!(restored, export);

    assert_eq!(restored.session.platform, "ci");
    assert_eq!(restored.session.app_version, "2.1.0");
    assert_eq!(restored.timeline.stages.len(), 3);
    assert_eq!(restored.timeline.services.len(), 4);
    assert_eq!(restored.circuit_breakers.len(), 2);
    assert_eq!(restored.circuit_breakers[1].key, "remote_api");
    assert_eq!(restored.circuit_breakers[1].state, CircuitState::Open);
    assert!(raw.contains("\"session_id\""));
}
