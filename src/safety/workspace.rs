/// Run-scoped workspace directories
///
/// Every execution gets a fresh directory under the workspace root. It is
/// removed by an explicit `cleanup()` and, failing that, on drop.
use crate::config::types::{Result, ScriptboxError};
use crate::observability::audit;
use crate::safety::safe_cleanup;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct Workspace {
    run_id: Uuid,
    run_dir: PathBuf,
    script: Option<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    /// Create a new private run directory under `root`
    pub fn create(root: &Path) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(root)
            .map_err(|e| {
                ScriptboxError::SandboxUnavailable(format!(
                    "Failed to create workspace root {}: {}",
                    root.display(),
                    e
                ))
            })?;

        let run_id = Uuid::new_v4();
        let run_dir = root.join(format!("run-{}", run_id));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&run_dir)
            .map_err(|e| {
                ScriptboxError::SandboxUnavailable(format!(
                    "Failed to create workspace directory {}: {}",
                    run_dir.display(),
                    e
                ))
            })?;

        log::debug!("Created workspace {}", run_dir.display());
        Ok(Self {
            run_id,
            run_dir,
            script: None,
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    /// Write the script into the workspace under `name`
    pub fn write_script(&mut self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.run_dir.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                ScriptboxError::SandboxUnavailable(format!(
                    "Failed to write script {}: {}",
                    path.display(),
                    e
                ))
            })?;
        io::Write::write_all(&mut file, content)?;
        self.script = Some(path.clone());
        Ok(path)
    }

    /// Remove the workspace (idempotent)
    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.cleaned {
            return Ok(());
        }
        let outcome = safe_cleanup::remove_tree_secure(&self.run_dir);
        audit::events::cleanup_outcome(self.run_id, &self.run_dir, outcome.as_ref().err());
        outcome?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!(
                "Failed to remove workspace {} on drop: {}",
                self.run_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_creation_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        let script = workspace.write_script("script.py", b"print(1)").unwrap();
        assert!(script.exists());
        assert_eq!(workspace.script(), Some(script.as_path()));

        workspace.cleanup().unwrap();
        assert!(!workspace.run_dir().exists());
        // second cleanup is a no-op
        workspace.cleanup().unwrap();
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let run_dir = {
            let workspace = Workspace::create(root.path()).unwrap();
            workspace.run_dir().to_path_buf()
        };
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_workspaces_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path()).unwrap();
        let b = Workspace::create(root.path()).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
    }

    #[test]
    fn test_cleanup_removes_files_written_by_the_script() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        std::fs::create_dir(workspace.run_dir().join("out")).unwrap();
        std::fs::write(workspace.run_dir().join("out/data.bin"), vec![0u8; 128]).unwrap();
        workspace.cleanup().unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
