//! Resident memory sampling for boot telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{Level, event};

/// Samples this process's resident memory and keeps the highest value seen.
///
/// Each sample refreshes only the current process, memory only.
pub struct PeakMemory {
    pid: Option<Pid>,
    system: Mutex<System>,
    peak: AtomicU64,
}

impl Default for PeakMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeakMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                event!(Level::DEBUG, error = err, "process memory sampling unavailable");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
            peak: AtomicU64::new(0),
        }
    }

    /// Current resident set size in bytes, if the platform exposes it.
    pub fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system
            .process(pid)
            .map(|process| process.memory())
            .filter(|bytes| *bytes > 0)
    }

    /// Takes a sample and folds it into the peak.
    pub fn sample(&self) -> Option<u64> {
        let current = self.resident_bytes()?;
        self.record(current);
        Some(current)
    }

    pub fn record(&self, bytes: u64) {
        self.peak.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn peak(&self) -> Option<u64> {
        match self.peak.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}

impl std::fmt::Debug for PeakMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakMemory")
            .field("pid", &self.pid)
            .field("peak", &self.peak())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_keeps_maximum() {
        let peak = PeakMemory::new();
        assert_eq!(peak.peak(), None);
        peak.record(10);
        peak.record(30);
        peak.record(20);
        assert_eq!(peak.peak(), Some(30));
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    #[test]
    fn test_sample_reads_own_process() {
        let memory = PeakMemory::new();
        let sampled = memory.sample().unwrap();
        assert!(sampled > 0);
        assert!(memory.peak().unwrap() >= sampled);

        // Memory sampling never lowers the peak.
        memory.record(1);
        assert!(memory.peak().unwrap() >= sampled);
    }
}
