use crate::config::types::FileKind;
use crate::runtime::ScriptRuntime;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PythonRuntime {
    interpreter: PathBuf,
}

impl PythonRuntime {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl ScriptRuntime for PythonRuntime {
    fn kind(&self) -> FileKind {
        FileKind::Python
    }

    fn command(&self, script: &Path) -> Vec<OsString> {
        // -I isolated mode, -S no site, -B no bytecode writes
        vec![
            self.interpreter.clone().into_os_string(),
            OsString::from("-I"),
            OsString::from("-S"),
            OsString::from("-B"),
            script.as_os_str().to_os_string(),
        ]
    }

    fn environment(&self, _workspace: &Path) -> Vec<(String, String)> {
        vec![
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ]
    }

    fn memory_exhausted(&self, stderr_tail: &str) -> bool {
        stderr_tail.contains("MemoryError")
    }
}
