/// Per-run cgroup v2 memory control
///
/// Each run gets a child cgroup under the configured parent. `memory.max`
/// caps the whole script tree, so forked children share one budget.
use crate::config::types::{Result, ScriptboxError};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const REMOVE_ATTEMPTS: u32 = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct MemoryCgroup {
    path: PathBuf,
    removed: bool,
}

/// Write an existing control file; never creates one
fn write_control(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(value.as_bytes())
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn cgroup_error(what: &str, path: &Path, e: io::Error) -> ScriptboxError {
    ScriptboxError::SandboxUnavailable(format!("{} {}: {}", what, path.display(), e))
}

impl MemoryCgroup {
    /// Create `run-<id>` under `parent` with the memory cap applied
    pub fn create(parent: &Path, run_id: Uuid, max_memory: u64, max_processes: u64) -> Result<Self> {
        let path = parent.join(format!("run-{}", run_id));
        fs::create_dir(&path).map_err(|e| cgroup_error("Failed to create cgroup", &path, e))?;
        let cgroup = Self {
            path,
            removed: false,
        };

        // A plain directory has no controller files; Drop removes it again
        write_control(&cgroup.path.join("memory.max"), &max_memory.to_string())
            .map_err(|e| cgroup_error("Failed to set memory.max in", &cgroup.path, e))?;

        for (file, value) in [
            ("memory.swap.max", "0".to_string()),
            ("memory.oom.group", "1".to_string()),
            ("pids.max", max_processes.to_string()),
        ] {
            let control = cgroup.path.join(file);
            if control.exists() {
                if let Err(e) = write_control(&control, &value) {
                    log::warn!("Failed to set {}: {}", control.display(), e);
                }
            }
        }

        log::debug!(
            "Created cgroup {} with memory.max={}",
            cgroup.path.display(),
            max_memory
        );
        Ok(cgroup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Memory charged to the whole script tree right now
    pub fn current(&self) -> Option<u64> {
        read_u64(&self.path.join("memory.current"))
    }

    /// memory.peak (kernel 5.19+) with fallback to memory.current
    pub fn peak(&self) -> Option<u64> {
        read_u64(&self.path.join("memory.peak")).or_else(|| self.current())
    }

    /// Whether the kernel OOM killer fired inside this cgroup
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| parse_oom_kills(&events) > 0)
            .unwrap_or(false)
    }

    /// SIGKILL every process left in the cgroup
    pub fn kill_all(&self) {
        if let Err(e) = write_control(&self.path.join("cgroup.kill"), "1") {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to kill cgroup {}: {}", self.path.display(), e);
            }
        }
    }

    /// Remove the cgroup, waiting briefly for killed members to be released
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(REMOVE_BACKOFF);
                }
                Err(e) => return Err(cgroup_error("Failed to remove cgroup", &self.path, e)),
            }
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for MemoryCgroup {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = self.remove() {
                log::error!("{}", e);
            }
        }
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
