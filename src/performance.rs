//! Performance metrics derived from execution telemetry.

use crate::config::types::{ExecutionTelemetry, ExitStatus, PerformanceMetrics};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Derive performance metrics from one run's telemetry. Pure.
///
/// A negative or non-finite duration is clamped to zero and flagged.
/// Throughput is only defined for a successful run that wrote output in a
/// measurable amount of time.
pub fn derive(telemetry: &ExecutionTelemetry) -> PerformanceMetrics {
    let (execution_time, clamped) = if telemetry.wall_time.is_finite() && telemetry.wall_time >= 0.0 {
        (telemetry.wall_time, false)
    } else {
        (0.0, true)
    };

    let output_bytes = telemetry.output_bytes();
    let throughput = (telemetry.exit_status == ExitStatus::Success
        && output_bytes > 0
        && execution_time > 0.0)
        .then(|| output_bytes as f64 / execution_time);

    PerformanceMetrics {
        execution_time,
        peak_memory_bytes: telemetry.memory_peak,
        peak_memory_mb: telemetry.memory_peak as f64 / BYTES_PER_MIB,
        output_bytes,
        throughput,
        response_time_ms: None,
        clamped,
    }
}
