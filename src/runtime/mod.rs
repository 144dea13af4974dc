//! Script runtimes.
//!
//! The sandbox stays language-agnostic. A runtime says how to launch one kind
//! of script and how to recognise its out-of-memory failure.

pub mod python;
pub mod registry;
pub mod sql;

use crate::config::types::FileKind;
use std::ffi::OsString;
use std::path::Path;

/// Launch contract for one script language
pub trait ScriptRuntime: Send + Sync {
    fn kind(&self) -> FileKind;

    /// File name the script is written under inside the workspace
    fn script_name(&self) -> String {
        format!("script.{}", self.kind().extension())
    }

    /// argv for running `script`; the first element is the program
    fn command(&self, script: &Path) -> Vec<OsString>;

    /// Extra environment on top of the scrubbed base
    fn environment(&self, workspace: &Path) -> Vec<(String, String)>;

    /// Whether a stderr tail shows the runtime gave up for lack of memory
    fn memory_exhausted(&self, stderr_tail: &str) -> bool;
}

pub use registry::runtime_for;
