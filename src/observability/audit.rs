/// Security audit trail for sandboxed runs
///
/// Events are emitted through `log` under the `scriptbox::audit` target at a
/// level derived from their severity, and appended as JSON lines to an audit
/// file when one is configured.
use crate::config::types::{Result, ScriptboxError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

const AUDIT_TARGET: &str = "scriptbox::audit";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecurityEventType {
    ExecutionStart,
    ExecutionEnd,
    WallTimeLimitViolation,
    MemoryLimitViolation,
    OutputLimitViolation,
    FileSizeLimitViolation,
    ForcedKill,
    ControlDegraded,
    SandboxUnavailable,
    ExecutionCancelled,
    CleanupSuccess,
    CleanupFailure,
    HighRiskScript,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ExecutionStart
            | SecurityEventType::ExecutionEnd
            | SecurityEventType::CleanupSuccess => SecuritySeverity::Low,
            SecurityEventType::OutputLimitViolation
            | SecurityEventType::FileSizeLimitViolation
            | SecurityEventType::ExecutionCancelled => SecuritySeverity::Medium,
            SecurityEventType::WallTimeLimitViolation
            | SecurityEventType::MemoryLimitViolation
            | SecurityEventType::ForcedKill
            | SecurityEventType::ControlDegraded
            | SecurityEventType::SandboxUnavailable
            | SecurityEventType::HighRiskScript => SecuritySeverity::High,
            SecurityEventType::CleanupFailure => SecuritySeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            run_id: None,
            upload_id: None,
            user_id: None,
            file_path: None,
            pid: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_upload(mut self, upload_id: Uuid, user_id: &str) -> Self {
        self.upload_id = Some(upload_id);
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_file_path(mut self, path: &Path) -> Self {
        self.file_path = Some(path.display().to_string());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Audit logger with an append-only JSON-lines file
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: PathBuf) -> Result<Self> {
        if let Some(parent) = audit_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ScriptboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| {
                ScriptboxError::Config(format!(
                    "Failed to open audit log {}: {}",
                    audit_path.display(),
                    e
                ))
            })?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_security_event(&self, event: &SecurityEvent) {
        emit_to_log(event);

        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!(target: AUDIT_TARGET, "Failed to serialize audit event: {}", e);
                return;
            }
        };
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!(target: AUDIT_TARGET, "Failed to write audit log: {}", e);
                }
            }
            Err(_) => error!(target: AUDIT_TARGET, "Audit log lock poisoned"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

fn emit_to_log(event: &SecurityEvent) {
    let run = event
        .run_id
        .map(|id| format!(" run={}", id))
        .unwrap_or_default();
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!(target: AUDIT_TARGET, "{:?}{} - {}", event.event_type, run, event.details)
        }
        SecuritySeverity::Medium => {
            warn!(target: AUDIT_TARGET, "{:?}{} - {}", event.event_type, run, event.details)
        }
        SecuritySeverity::Low => {
            info!(target: AUDIT_TARGET, "{:?}{} - {}", event.event_type, run, event.details)
        }
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Install the process-wide audit file. Events before this go to `log` only.
pub fn init_security_logger(audit_path: PathBuf) -> Result<()> {
    let logger = SecurityLogger::new(audit_path)?;
    let path = logger.audit_path().to_path_buf();
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!(target: AUDIT_TARGET, "Audit logger already initialized; ignoring {}", path.display());
    } else {
        info!(target: AUDIT_TARGET, "Audit log at {}", path.display());
    }
    Ok(())
}

pub fn log_security_event(event: SecurityEvent) {
    match SECURITY_LOGGER.get() {
        Some(logger) => logger.log_security_event(&event),
        None => emit_to_log(&event),
    }
}

/// Convenience constructors for the events the pipeline emits
pub mod events {
    use super::*;
    use crate::config::types::{BlockedReason, ExitStatus, FileKind};
    use std::time::Duration;

    pub fn execution_start(run_id: Uuid, upload_id: Uuid, user_id: &str, kind: FileKind) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ExecutionStart,
                format!("starting {} script", kind),
            )
            .with_run_id(run_id)
            .with_upload(upload_id, user_id),
        );
    }

    pub fn execution_end(run_id: Uuid, status: ExitStatus, wall_time: f64, degraded: bool) {
        let mut event = SecurityEvent::new(
            SecurityEventType::ExecutionEnd,
            format!(
                "finished with {} after {:.3}s{}",
                status,
                wall_time,
                if degraded { " (degraded isolation)" } else { "" }
            ),
        )
        .with_run_id(run_id);
        if status.is_unsafe_outcome() {
            event = event.with_severity(SecuritySeverity::Medium);
        }
        log_security_event(event);
    }

    pub fn wall_time_exceeded(run_id: Uuid, limit: Duration) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::WallTimeLimitViolation,
                format!("wall time limit of {:?} exceeded", limit),
            )
            .with_run_id(run_id),
        );
    }

    pub fn limit_blocked(run_id: Uuid, reason: BlockedReason, limit: u64) {
        let event_type = match reason {
            BlockedReason::MemoryLimit => SecurityEventType::MemoryLimitViolation,
            BlockedReason::OutputLimit => SecurityEventType::OutputLimitViolation,
            BlockedReason::FileSizeLimit => SecurityEventType::FileSizeLimitViolation,
        };
        log_security_event(
            SecurityEvent::new(event_type, format!("{} of {} bytes exceeded", reason, limit))
                .with_run_id(run_id),
        );
    }

    pub fn forced_kill(run_id: Uuid, pid: i32, why: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ForcedKill,
                format!("SIGKILL sent to process group {}: {}", pid, why),
            )
            .with_run_id(run_id)
            .with_pid(pid),
        );
    }

    pub fn control_degraded(run_id: Uuid, missing: &[String], cause: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ControlDegraded,
                format!(
                    "running without {} ({})",
                    missing.join(", "),
                    cause
                ),
            )
            .with_run_id(run_id),
        );
    }

    pub fn sandbox_unavailable(run_id: Uuid, cause: &str) {
        log_security_event(
            SecurityEvent::new(SecurityEventType::SandboxUnavailable, cause.to_string())
                .with_run_id(run_id),
        );
    }

    pub fn execution_cancelled(run_id: Uuid) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ExecutionCancelled,
                "execution cancelled by caller",
            )
            .with_run_id(run_id),
        );
    }

    pub fn cleanup_outcome(run_id: Uuid, path: &Path, error: Option<&std::io::Error>) {
        let event = match error {
            None => SecurityEvent::new(SecurityEventType::CleanupSuccess, "workspace removed"),
            Some(e) => {
                crate::observability::metrics::get_metrics()
                    .cleanup_failures
                    .inc();
                SecurityEvent::new(
                    SecurityEventType::CleanupFailure,
                    format!("workspace removal failed: {}", e),
                )
            }
        };
        log_security_event(event.with_run_id(run_id).with_file_path(path));
    }

    pub fn high_risk_script(upload_id: Uuid, user_id: &str, filename: &str, score: u32) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::HighRiskScript,
                format!("{} scored {} on static analysis", filename, score),
            )
            .with_upload(upload_id, user_id),
        );
    }
}
