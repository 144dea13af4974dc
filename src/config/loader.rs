/// Analyzer configuration loaded from a JSON file
use crate::config::types::{ResourceLimits, Result, ScriptboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the sandbox does when namespace isolation cannot be set up
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Namespace setup failure is a sandbox failure
    Strict,
    /// Fall back to rlimit-only isolation and report the missing controls
    Permissive,
}

/// Full analyzer configuration. Every key is optional in the JSON file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub max_wall_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_output_bytes: u64,
    pub max_concurrent_sandboxes: usize,
    pub sandbox_acquire_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub isolation: IsolationMode,
    pub python_interpreter: PathBuf,
    /// Disposable-database runner; defaults to `scriptbox-sql` next to the current executable
    pub sql_runner: Option<PathBuf>,
    pub workspace_root: PathBuf,
    /// Host directories hidden behind an empty tmpfs inside the sandbox
    pub masked_paths: Vec<PathBuf>,
    /// Delegated cgroup v2 directory; each run gets a child with `memory.max` set
    pub cgroup_parent: Option<PathBuf>,
    pub max_open_files: u64,
    pub max_processes: u64,
    pub max_upload_bytes: u64,
    pub stderr_tail_bytes: usize,
    pub database_path: PathBuf,
    pub audit_log: Option<PathBuf>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_wall_time_ms: limits.max_wall_time.as_millis() as u64,
            max_memory_bytes: limits.max_memory,
            max_output_bytes: limits.max_output_size,
            max_concurrent_sandboxes: 4,
            sandbox_acquire_timeout_ms: 10_000,
            retry_backoff_ms: 250,
            isolation: IsolationMode::Strict,
            python_interpreter: PathBuf::from("/usr/bin/python3"),
            sql_runner: None,
            workspace_root: std::env::temp_dir().join("scriptbox"),
            masked_paths: [
                "/home",
                "/root",
                "/mnt",
                "/media",
                "/srv",
                "/var",
                "/tmp",
                "/run",
                "/etc/ssh",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            cgroup_parent: None,
            max_open_files: 64,
            max_processes: 64,
            max_upload_bytes: 1024 * 1024,
            stderr_tail_bytes: 2048,
            database_path: PathBuf::from("scriptbox.db"),
            audit_log: None,
        }
    }
}

impl AnalyzerConfig {
    /// Load configuration from a JSON file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScriptboxError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
            .map_err(|e| ScriptboxError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ScriptboxError::Config(format!("Invalid config JSON: {}", e)))
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_wall_time: Duration::from_millis(self.max_wall_time_ms),
            max_memory: self.max_memory_bytes,
            max_output_size: self.max_output_bytes,
        }
    }

    pub fn sandbox_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_acquire_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn is_strict(&self) -> bool {
        self.isolation == IsolationMode::Strict
    }

    /// Resolve the SQL runner path
    pub fn sql_runner_path(&self) -> PathBuf {
        if let Some(path) = &self.sql_runner {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("scriptbox-sql")))
            .unwrap_or_else(|| PathBuf::from("scriptbox-sql"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = AnalyzerConfig::from_json(r#"{ "max_wall_time_ms": 1500 }"#).unwrap();
        assert_eq!(config.max_wall_time_ms, 1500);
        assert_eq!(config.max_concurrent_sandboxes, 4);
        assert_eq!(config.isolation, IsolationMode::Strict);
    }

    #[test]
    fn isolation_mode_is_lowercase_in_json() {
        let config = AnalyzerConfig::from_json(r#"{ "isolation": "permissive" }"#).unwrap();
        assert!(!config.is_strict());
    }

    #[test]
    fn resource_limits_follow_config() {
        let config = AnalyzerConfig {
            max_wall_time_ms: 2000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 4096,
            ..AnalyzerConfig::default()
        };
        let limits = config.resource_limits();
        assert_eq!(limits.max_wall_time, Duration::from_secs(2));
        assert_eq!(limits.max_memory, 64 * 1024 * 1024);
        assert_eq!(limits.max_output_size, 4096);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = AnalyzerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ScriptboxError::Config(_)));
    }

    #[test]
    fn explicit_sql_runner_wins() {
        let config = AnalyzerConfig {
            sql_runner: Some(PathBuf::from("/opt/runner")),
            ..AnalyzerConfig::default()
        };
        assert_eq!(config.sql_runner_path(), PathBuf::from("/opt/runner"));
    }
}
