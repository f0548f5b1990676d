use serde::Serialize;
use std::time::Instant;

use crate::health::runner::HealthCheckSummary;
use crate::state::{new_state, read_copy, Shared};
use crate::sync::{SchedulerState, SyncPhase, SyncSummary};

/// État du kernel exposé par GET /system/health.
#[derive(Debug, Serialize)]
pub struct KernelStatus {
    pub uptime_seconds: u64,
    pub scheduler: SchedulerState,
    pub phase: SyncPhase,
    pub nodes_tracked: usize,
    pub datastore_configured: bool,
    pub upstream_configured: bool,
    pub memory_usage_mb: f32,
    pub last_sync: Option<SyncSummary>,
    pub last_health_check: Option<HealthCheckSummary>,
}

/// Derniers résumés de cycles, partagés entre le scheduler et l'API.
#[derive(Clone)]
pub struct StatusTracker {
    start_time: Instant,
    last_sync: Shared<Option<SyncSummary>>,
    last_health: Shared<Option<HealthCheckSummary>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_sync: new_state(None),
            last_health: new_state(None),
        }
    }

    pub fn record_sync(&self, summary: &SyncSummary) {
        *self.last_sync.lock() = Some(summary.clone());
    }

    pub fn record_health(&self, summary: &HealthCheckSummary) {
        *self.last_health.lock() = Some(summary.clone());
    }

    pub fn last_sync(&self) -> Option<SyncSummary> {
        read_copy(&self.last_sync)
    }

    pub fn last_health(&self) -> Option<HealthCheckSummary> {
        read_copy(&self.last_health)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Mémoire résidente du process (Linux uniquement, 0 ailleurs).
pub fn memory_usage_mb() -> f32 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f32>().ok())
        })
        .map(|kb| kb / 1024.0)
        .unwrap_or(0.0)
}
