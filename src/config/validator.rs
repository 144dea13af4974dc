// Config validation
// Fail fast on limits that would make every run meaningless; warn on ones
// that are legal but likely to misclassify ordinary scripts.

use crate::config::loader::{AnalyzerConfig, IsolationMode};
use crate::config::types::{Result, ScriptboxError};
use std::path::Path;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config before the pipeline is built.
/// Errors are returned as `ScriptboxError::Config`; warnings are logged and returned.
pub fn validate_config(config: &AnalyzerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_concurrency(config, &mut result);
    validate_paths(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(ScriptboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &AnalyzerConfig, result: &mut ValidationResult) {
    if config.max_wall_time_ms == 0 {
        result.add_error("max_wall_time_ms cannot be zero".to_string());
    }

    if config.max_memory_bytes == 0 {
        result.add_error("max_memory_bytes cannot be zero".to_string());
    } else if config.max_memory_bytes < 16 * 1024 * 1024 {
        result.add_warning(format!(
            "max_memory_bytes {} is very low (< 16MB); interpreters may fail to start",
            config.max_memory_bytes
        ));
    }

    if config.max_output_bytes == 0 {
        result.add_error("max_output_bytes cannot be zero".to_string());
    }

    if config.max_upload_bytes == 0 {
        result.add_error("max_upload_bytes cannot be zero".to_string());
    }

    if config.max_open_files < 8 {
        result.add_error(format!(
            "max_open_files {} is too low to start an interpreter (need >= 8)",
            config.max_open_files
        ));
    }

    if config.max_processes == 0 {
        result.add_error("max_processes cannot be zero".to_string());
    }
}

fn validate_concurrency(config: &AnalyzerConfig, result: &mut ValidationResult) {
    if config.max_concurrent_sandboxes == 0 {
        result.add_error("max_concurrent_sandboxes must be at least 1".to_string());
    }

    // A zero acquire timeout is allowed: it means "fail immediately when busy".
    if config.sandbox_acquire_timeout_ms > 0
        && config.sandbox_acquire_timeout_ms < config.max_wall_time_ms
    {
        result.add_warning(format!(
            "sandbox_acquire_timeout_ms ({}) is shorter than max_wall_time_ms ({}); \
             requests may report busy while a single slow script runs",
            config.sandbox_acquire_timeout_ms, config.max_wall_time_ms
        ));
    }
}

fn validate_paths(config: &AnalyzerConfig, result: &mut ValidationResult) {
    if !config.workspace_root.is_absolute() {
        result.add_error(format!(
            "workspace_root must be an absolute path: {}",
            config.workspace_root.display()
        ));
    }

    if !config.python_interpreter.is_absolute() {
        result.add_error(format!(
            "python_interpreter must be an absolute path: {}",
            config.python_interpreter.display()
        ));
    } else if !config.python_interpreter.exists() {
        result.add_warning(format!(
            "python_interpreter does not exist: {}",
            config.python_interpreter.display()
        ));
    }

    for masked in &config.masked_paths {
        if !masked.is_absolute() {
            result.add_error(format!(
                "masked path must be absolute: {}",
                masked.display()
            ));
        }
    }

    match &config.cgroup_parent {
        Some(parent) if !parent.is_absolute() => result.add_error(format!(
            "cgroup_parent must be an absolute path: {}",
            parent.display()
        )),
        Some(_) => {}
        None => result.add_warning(
            "no cgroup_parent; memory is capped per process and sampled per session".to_string(),
        ),
    }

    if config.isolation == IsolationMode::Permissive {
        result.add_warning(
            "isolation is permissive; runs may proceed without namespace isolation".to_string(),
        );
    }
}

/// Report host facilities the sandbox relies on that are missing
pub fn check_system_capabilities(config: &AnalyzerConfig) -> Vec<String> {
    let mut missing = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if !Path::new("/proc/self/ns/user").exists() {
            missing.push("user namespaces not available".to_string());
        }
        if let Ok(raw) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
            if raw.trim() == "0" && unsafe { libc::geteuid() } != 0 {
                missing.push("unprivileged user namespaces disabled by sysctl".to_string());
            }
        }
        if !Path::new("/proc/self/status").exists() {
            missing.push("/proc not mounted; memory sampling unavailable".to_string());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        missing.push("Linux-only features not available on this platform".to_string());
    }

    if !config.python_interpreter.exists() {
        missing.push(format!(
            "python interpreter not found at {}",
            config.python_interpreter.display()
        ));
    }

    let runner = config.sql_runner_path();
    if !runner.exists() {
        missing.push(format!("sql runner not found at {}", runner.display()));
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_default_config() {
        let config = AnalyzerConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_wall_time_rejected() {
        let config = AnalyzerConfig {
            max_wall_time_ms: 0,
            ..AnalyzerConfig::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("max_wall_time_ms cannot be zero"));
    }

    #[test]
    fn test_zero_memory_and_output_rejected_together() {
        let config = AnalyzerConfig {
            max_memory_bytes: 0,
            max_output_bytes: 0,
            ..AnalyzerConfig::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("max_memory_bytes"));
        assert!(err.contains("max_output_bytes"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = AnalyzerConfig {
            max_concurrent_sandboxes: 0,
            ..AnalyzerConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_acquire_timeout_allowed() {
        let config = AnalyzerConfig {
            sandbox_acquire_timeout_ms: 0,
            ..AnalyzerConfig::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_relative_workspace_root_rejected() {
        let config = AnalyzerConfig {
            workspace_root: PathBuf::from("relative/ws"),
            ..AnalyzerConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_low_memory_is_a_warning() {
        let config = AnalyzerConfig {
            max_memory_bytes: 1024 * 1024,
            ..AnalyzerConfig::default()
        };
        let result = validate_config(&config).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("very low")));
    }

    #[test]
    fn test_cgroup_parent_checked() {
        let result = validate_config(&AnalyzerConfig::default()).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("cgroup_parent")));

        let config = AnalyzerConfig {
            cgroup_parent: Some(PathBuf::from("scriptbox")),
            ..AnalyzerConfig::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("cgroup_parent must be an absolute path"));

        let config = AnalyzerConfig {
            cgroup_parent: Some(PathBuf::from("/sys/fs/cgroup/scriptbox")),
            ..AnalyzerConfig::default()
        };
        let result = validate_config(&config).unwrap();
        assert!(!result.warnings.iter().any(|w| w.contains("cgroup_parent")));
    }
}
