/// Core types and structures for the scriptbox pipeline
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Script language accepted by the pipeline
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileKind {
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "sql")]
    Sql,
}

impl FileKind {
    /// Resolve a file kind from a filename extension (case-insensitive)
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "py" => Some(FileKind::Python),
            "sql" => Some(FileKind::Sql),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Python => "py",
            FileKind::Sql => "sql",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Python => "python",
            FileKind::Sql => "sql",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded script. Immutable once created.
#[derive(Clone, Debug)]
pub struct ScriptUpload {
    id: Uuid,
    user_id: String,
    kind: FileKind,
    filename: String,
    content: Arc<[u8]>,
    digest: String,
    uploaded_at: DateTime<Utc>,
}

impl ScriptUpload {
    pub fn new(
        user_id: impl Into<String>,
        filename: impl Into<String>,
        kind: FileKind,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        let content: Vec<u8> = content.into();
        let digest = format!("{:x}", Sha256::digest(&content));
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            filename: filename.into(),
            content: Arc::from(content),
            digest,
            uploaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Hex SHA-256 of the content
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        self.uploaded_at
    }
}

/// Resource limits a single execution is held to.
/// Every limit is mandatory; there is no unbounded value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Wall clock limit
    #[serde(with = "duration_ms")]
    pub max_wall_time: Duration,
    /// Address-space / resident memory limit in bytes
    pub max_memory: u64,
    /// Combined stdout+stderr limit in bytes
    pub max_output_size: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_wall_time: Duration::from_secs(5),
            max_memory: 256 * 1024 * 1024,
            max_output_size: 1024 * 1024,
        }
    }
}

/// Exit status of one execution attempt - closed set
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CRASHED")]
    Crashed,
    #[serde(rename = "BLOCKED")]
    Blocked,
}

impl ExitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatus::Success => "SUCCESS",
            ExitStatus::Timeout => "TIMEOUT",
            ExitStatus::Crashed => "CRASHED",
            ExitStatus::Blocked => "BLOCKED",
        }
    }

    /// Outcomes that are themselves a runtime security signal
    pub fn is_unsafe_outcome(self) -> bool {
        matches!(self, ExitStatus::Crashed | ExitStatus::Blocked)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which limit forced a BLOCKED outcome
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockedReason {
    #[serde(rename = "memory_limit")]
    MemoryLimit,
    #[serde(rename = "output_limit")]
    OutputLimit,
    #[serde(rename = "file_size_limit")]
    FileSizeLimit,
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockedReason::MemoryLimit => write!(f, "memory limit"),
            BlockedReason::OutputLimit => write!(f, "output limit"),
            BlockedReason::FileSizeLimit => write!(f, "file size limit"),
        }
    }
}

/// Isolation controls requested for a run and what actually took effect
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct IsolationReport {
    pub applied_controls: Vec<String>,
    pub missing_controls: Vec<String>,
}

impl IsolationReport {
    pub fn is_degraded(&self) -> bool {
        !self.missing_controls.is_empty()
    }
}

/// Raw measurements captured during one execution attempt
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTelemetry {
    /// Wall clock time used (seconds)
    pub wall_time: f64,
    /// Peak resident memory observed (bytes)
    pub memory_peak: u64,
    pub exit_status: ExitStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub blocked_reason: Option<BlockedReason>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub output_truncated: bool,
    /// Last bytes of stderr, lossily decoded
    pub stderr_tail: String,
    pub limits: ResourceLimits,
    pub isolation: IsolationReport,
}

impl ExecutionTelemetry {
    pub fn output_bytes(&self) -> u64 {
        self.stdout_bytes + self.stderr_bytes
    }

    /// One-line outcome description suitable for a report header
    pub fn summary(&self) -> String {
        match self.exit_status {
            ExitStatus::Success => format!("completed in {:.3}s", self.wall_time),
            ExitStatus::Timeout => format!(
                "execution timed out after {:.1}s",
                self.limits.max_wall_time.as_secs_f64()
            ),
            ExitStatus::Crashed => match (self.exit_code, self.signal) {
                (_, Some(sig)) => format!("crashed with signal {sig} after {:.3}s", self.wall_time),
                (Some(code), None) => {
                    format!("exited with status {code} after {:.3}s", self.wall_time)
                }
                (None, None) => format!("crashed after {:.3}s", self.wall_time),
            },
            ExitStatus::Blocked => match self.blocked_reason {
                Some(reason) => format!("blocked: exceeded {reason} after {:.3}s", self.wall_time),
                None => format!("blocked after {:.3}s", self.wall_time),
            },
        }
    }
}

/// Risk finding category
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RiskCategory {
    #[serde(rename = "CODE_INJECTION")]
    CodeInjection,
    #[serde(rename = "UNSAFE_IO")]
    UnsafeIo,
    #[serde(rename = "UNSAFE_EXEC")]
    UnsafeExec,
    #[serde(rename = "UNSAFE_NETWORK")]
    UnsafeNetwork,
    #[serde(rename = "DANGEROUS_IMPORT")]
    DangerousImport,
    #[serde(rename = "HARDCODED_SECRET")]
    HardcodedSecret,
    #[serde(rename = "SQL_INJECTION_PATTERN")]
    SqlInjectionPattern,
    #[serde(rename = "DESTRUCTIVE_STATEMENT")]
    DestructiveStatement,
    #[serde(rename = "PRIVILEGE_ESCALATION")]
    PrivilegeEscalation,
    #[serde(rename = "PARSE_FAILURE")]
    ParseFailure,
}

/// Finding severity, ordered from least to most severe
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn weight(self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 3,
            Severity::High => 7,
            Severity::Critical => 15,
        }
    }
}

/// Position of a finding in the source (1-based line and column, 0-based byte offset)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

/// One detected indicator of unsafe code or query behavior
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskFinding {
    pub rule_id: String,
    pub category: RiskCategory,
    pub severity: Severity,
    pub location: Location,
    pub description: String,
}

/// Coarse risk band shown alongside the numeric score
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "critical")]
    Critical,
}

impl From<Severity> for RiskLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => RiskLevel::Low,
            Severity::Medium => RiskLevel::Medium,
            Severity::High => RiskLevel::High,
            Severity::Critical => RiskLevel::Critical,
        }
    }
}

/// Performance metrics derived from telemetry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    /// Execution time (seconds)
    pub execution_time: f64,
    pub peak_memory_bytes: u64,
    pub peak_memory_mb: f64,
    pub output_bytes: u64,
    /// Output bytes per second; only defined for successful runs that produced output
    pub throughput: Option<f64>,
    /// End-to-end orchestration latency (milliseconds)
    pub response_time_ms: Option<f64>,
    /// Set when malformed telemetry values were clamped
    pub clamped: bool,
}

impl PerformanceMetrics {
    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time_ms = Some(response_time.as_secs_f64() * 1000.0);
        self
    }
}

/// Immutable result of one full analysis pass over one upload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    id: Uuid,
    upload_id: Uuid,
    user_id: String,
    filename: String,
    file_kind: FileKind,
    content_digest: String,
    telemetry: ExecutionTelemetry,
    metrics: PerformanceMetrics,
    findings: Vec<RiskFinding>,
    static_score: u32,
    runtime_adjustment: u32,
    risk_score: u32,
    risk_level: RiskLevel,
    created_at: DateTime<Utc>,
}

/// Parts assembled by the orchestrator before a record is sealed
pub(crate) struct RecordParts {
    pub telemetry: ExecutionTelemetry,
    pub metrics: PerformanceMetrics,
    pub findings: Vec<RiskFinding>,
    pub static_score: u32,
    pub runtime_adjustment: u32,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub(crate) fn seal(upload: &ScriptUpload, parts: RecordParts) -> Self {
        Self {
            id: Uuid::new_v4(),
            upload_id: upload.id(),
            user_id: upload.user_id().to_string(),
            filename: upload.filename().to_string(),
            file_kind: upload.kind(),
            content_digest: upload.digest().to_string(),
            telemetry: parts.telemetry,
            metrics: parts.metrics,
            findings: parts.findings,
            static_score: parts.static_score,
            runtime_adjustment: parts.runtime_adjustment,
            risk_score: parts.static_score + parts.runtime_adjustment,
            risk_level: parts.risk_level,
            created_at: parts.created_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_kind(&self) -> FileKind {
        self.file_kind
    }

    pub fn content_digest(&self) -> &str {
        &self.content_digest
    }

    pub fn telemetry(&self) -> &ExecutionTelemetry {
        &self.telemetry
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn findings(&self) -> &[RiskFinding] {
        &self.findings
    }

    /// Score from static analysis alone
    pub fn static_score(&self) -> u32 {
        self.static_score
    }

    /// Penalty added for an unsafe runtime outcome
    pub fn runtime_adjustment(&self) -> u32 {
        self.runtime_adjustment
    }

    pub fn risk_score(&self) -> u32 {
        self.risk_score
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Human-readable report line
    pub fn summary(&self) -> String {
        format!(
            "{} ({}): {}; risk score {} ({:?}, {} finding{})",
            self.filename,
            self.file_kind,
            self.telemetry.summary(),
            self.risk_score,
            self.risk_level,
            self.findings.len(),
            if self.findings.len() == 1 { "" } else { "s" }
        )
    }
}

/// Custom error types for scriptbox
#[derive(Error, Debug)]
pub enum ScriptboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("All sandboxes busy (waited {waited:?})")]
    SandboxBusy { waited: Duration },

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Analysis cancelled; sandbox resources were released")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ScriptboxError {
    /// System failures a caller may retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScriptboxError::SandboxBusy { .. }
                | ScriptboxError::SandboxUnavailable(_)
                | ScriptboxError::AnalysisFailed(_)
        )
    }
}

impl From<rusqlite::Error> for ScriptboxError {
    fn from(err: rusqlite::Error) -> Self {
        ScriptboxError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ScriptboxError {
    fn from(err: serde_json::Error) -> Self {
        ScriptboxError::Storage(format!("record serialization: {err}"))
    }
}

impl From<nix::errno::Errno> for ScriptboxError {
    fn from(err: nix::errno::Errno) -> Self {
        ScriptboxError::SandboxUnavailable(err.to_string())
    }
}

/// Result type alias for scriptbox operations
pub type Result<T> = std::result::Result<T, ScriptboxError>;

/// Serialize durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_kind_from_extension_is_case_insensitive() {
        assert_eq!(FileKind::from_extension("PY"), Some(FileKind::Python));
        assert_eq!(FileKind::from_extension("sql"), Some(FileKind::Sql));
        assert_eq!(FileKind::from_extension("sh"), None);
    }

    #[test]
    fn upload_digest_is_content_addressed() {
        let a = ScriptUpload::new("u1", "a.py", FileKind::Python, b"print(1)".to_vec());
        let b = ScriptUpload::new("u2", "b.py", FileKind::Python, b"print(1)".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn severity_weights_are_ordered() {
        assert!(Severity::Low < Severity::Critical);
        assert_eq!(Severity::Low.weight(), 1);
        assert_eq!(Severity::Medium.weight(), 3);
        assert_eq!(Severity::High.weight(), 7);
        assert_eq!(Severity::Critical.weight(), 15);
    }

    #[test]
    fn timeout_summary_reports_the_wall_limit() {
        let telemetry = ExecutionTelemetry {
            wall_time: 2.004,
            memory_peak: 0,
            exit_status: ExitStatus::Timeout,
            exit_code: None,
            signal: Some(9),
            blocked_reason: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            output_truncated: false,
            stderr_tail: String::new(),
            limits: ResourceLimits {
                max_wall_time: Duration::from_secs(2),
                ..ResourceLimits::default()
            },
            isolation: IsolationReport::default(),
        };
        assert_eq!(telemetry.summary(), "execution timed out after 2.0s");
    }

    #[test]
    fn limits_serialize_wall_time_as_millis() {
        let json = serde_json::to_value(ResourceLimits::default()).unwrap();
        assert_eq!(json["max_wall_time"], 5000);
    }

    #[test]
    fn only_system_capacity_failures_are_retryable() {
        assert!(ScriptboxError::SandboxBusy {
            waited: Duration::ZERO
        }
        .is_retryable());
        assert!(ScriptboxError::SandboxUnavailable("no userns".into()).is_retryable());
        assert!(ScriptboxError::AnalysisFailed("retry exhausted".into()).is_retryable());
        assert!(!ScriptboxError::Cancelled.is_retryable());
        assert!(!ScriptboxError::InvalidUpload("x".into()).is_retryable());
    }
}
