use crate::config::types::FileKind;
use crate::runtime::ScriptRuntime;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Runs SQL through the `scriptbox-sql` helper against a throwaway in-memory database
#[derive(Debug, Clone)]
pub struct SqlRuntime {
    runner: PathBuf,
}

impl SqlRuntime {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
        }
    }
}

impl ScriptRuntime for SqlRuntime {
    fn kind(&self) -> FileKind {
        FileKind::Sql
    }

    fn command(&self, script: &Path) -> Vec<OsString> {
        vec![
            self.runner.clone().into_os_string(),
            script.as_os_str().to_os_string(),
        ]
    }

    fn environment(&self, _workspace: &Path) -> Vec<(String, String)> {
        vec![("RUST_LOG".to_string(), "off".to_string())]
    }

    fn memory_exhausted(&self, stderr_tail: &str) -> bool {
        let tail = stderr_tail.to_ascii_lowercase();
        tail.contains("out of memory") || tail.contains("memory allocation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_passes_script_to_runner() {
        let runtime = SqlRuntime::new("/opt/scriptbox-sql");
        let argv = runtime.command(Path::new("/ws/script.sql"));
        assert_eq!(
            argv,
            vec![
                OsString::from("/opt/scriptbox-sql"),
                OsString::from("/ws/script.sql")
            ]
        );
        assert_eq!(runtime.script_name(), "script.sql");
    }

    #[test]
    fn sqlite_nomem_marker() {
        let runtime = SqlRuntime::new("runner");
        assert!(runtime.memory_exhausted("error: out of memory"));
        assert!(!runtime.memory_exhausted("error: no such table: t"));
    }
}
