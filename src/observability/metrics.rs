// Pipeline counters
//
// Process-wide atomic counters for analyses, execution outcomes, sandbox
// contention and cleanup failures. A snapshot serializes for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::types::ExitStatus;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate at zero rather than wrap
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub analyses_started: Counter,
    pub analyses_completed: Counter,
    pub executions_success: Counter,
    pub executions_timeout: Counter,
    pub executions_crashed: Counter,
    pub executions_blocked: Counter,
    pub sandbox_busy: Counter,
    pub sandbox_unavailable: Counter,
    pub retries: Counter,
    pub cancellations: Counter,
    pub degraded_runs: Counter,
    pub cleanup_failures: Counter,
    pub storage_failures: Counter,
    pub active_sandboxes: Gauge,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub analyses_started: u64,
    pub analyses_completed: u64,
    pub executions_success: u64,
    pub executions_timeout: u64,
    pub executions_crashed: u64,
    pub executions_blocked: u64,
    pub sandbox_busy: u64,
    pub sandbox_unavailable: u64,
    pub retries: u64,
    pub cancellations: u64,
    pub degraded_runs: u64,
    pub cleanup_failures: u64,
    pub storage_failures: u64,
    pub active_sandboxes: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exit_status(&self, status: ExitStatus) {
        match status {
            ExitStatus::Success => self.executions_success.inc(),
            ExitStatus::Timeout => self.executions_timeout.inc(),
            ExitStatus::Crashed => self.executions_crashed.inc(),
            ExitStatus::Blocked => self.executions_blocked.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            analyses_started: self.analyses_started.get(),
            analyses_completed: self.analyses_completed.get(),
            executions_success: self.executions_success.get(),
            executions_timeout: self.executions_timeout.get(),
            executions_crashed: self.executions_crashed.get(),
            executions_blocked: self.executions_blocked.get(),
            sandbox_busy: self.sandbox_busy.get(),
            sandbox_unavailable: self.sandbox_unavailable.get(),
            retries: self.retries.get(),
            cancellations: self.cancellations.get(),
            degraded_runs: self.degraded_runs.get(),
            cleanup_failures: self.cleanup_failures.get(),
            storage_failures: self.storage_failures.get(),
            active_sandboxes: self.active_sandboxes.get(),
        }
    }
}

static METRICS: once_cell::sync::Lazy<Arc<PipelineMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(PipelineMetrics::new()));

/// Process-wide metrics registry
pub fn get_metrics() -> Arc<PipelineMetrics> {
    Arc::clone(&METRICS)
}
