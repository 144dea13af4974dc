//! Strict-mode isolation tests
//!
//! Run scripts with namespace isolation required and check what the script
//! can see and modify on the host. Skipped where unprivileged user
//! namespaces are unavailable.

use scriptbox::config::loader::{AnalyzerConfig, IsolationMode};
use scriptbox::store::MemoryStore;
use scriptbox::{ExitStatus, FileKind, Orchestrator, ScriptUpload};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Whether this host lets an unprivileged child own a mount namespace
fn user_namespaces_work() -> bool {
    let mut command = Command::new("/bin/true");
    unsafe {
        command.pre_exec(|| {
            if libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) != 0 {
                return Err(io::Error::last_os_error());
            }
            let root = b"/\0";
            let rc = libc::mount(
                std::ptr::null(),
                root.as_ptr().cast(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            );
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    matches!(command.status(), Ok(status) if status.success())
}

fn python3() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let masks = AnalyzerConfig::default().masked_paths;
    std::env::split_paths(&path)
        .map(|dir| dir.join("python3"))
        .filter(|candidate| !masks.iter().any(|mask| candidate.starts_with(mask)))
        .find(|candidate| candidate.is_file())
}

fn strict_config(workspace_root: &Path, python: &Path) -> AnalyzerConfig {
    AnalyzerConfig {
        workspace_root: workspace_root.to_path_buf(),
        python_interpreter: python.to_path_buf(),
        sql_runner: Some(PathBuf::from(env!("CARGO_BIN_EXE_scriptbox-sql"))),
        isolation: IsolationMode::Strict,
        max_wall_time_ms: 10_000,
        sandbox_acquire_timeout_ms: 10_000,
        retry_backoff_ms: 10,
        ..AnalyzerConfig::default()
    }
}

fn orchestrator(config: AnalyzerConfig) -> Orchestrator {
    Orchestrator::from_config(config, Arc::new(MemoryStore::new())).unwrap()
}

macro_rules! require_user_namespaces {
    () => {
        if !user_namespaces_work() {
            eprintln!("skipping: unprivileged user namespaces unavailable");
            return;
        }
    };
}

#[test]
fn host_temp_files_and_shared_memory_are_out_of_reach() {
    require_user_namespaces!();
    let Some(python) = python3() else {
        eprintln!("skipping: no python3 outside the masked directories");
        return;
    };

    // Both live under the host /tmp, which also holds the workspace root
    let secrets = tempfile::Builder::new().tempdir_in("/tmp").unwrap();
    let secret = secrets.path().join("secret.txt");
    std::fs::write(&secret, b"host secret").unwrap();
    let root = tempfile::Builder::new().tempdir_in("/tmp").unwrap();
    std::fs::create_dir(root.path().join("run-other")).unwrap();
    let planted = secrets.path().join("planted.txt");
    let shm = PathBuf::from(format!("/dev/shm/scriptbox-escape-{}", std::process::id()));

    let source = format!(
        r#"import os

def attempt(action):
    try:
        action()
        return 'ok'
    except OSError:
        return 'denied'

def write(path):
    with open(path, 'w') as f:
        f.write('x')

results = [
    attempt(lambda: open({secret:?}).read()),
    attempt(lambda: write({planted:?})),
    attempt(lambda: write({shm:?})),
    attempt(lambda: write('own.txt')),
    str(len(os.listdir('..'))),
]
os.write(2, ','.join(results).encode())
"#,
        secret = secret.display().to_string(),
        planted = planted.display().to_string(),
        shm = shm.display().to_string(),
    );

    let orch = orchestrator(strict_config(root.path(), &python));
    let upload = ScriptUpload::new("alice", "escape.py", FileKind::Python, source.into_bytes());
    let record = orch.analyze_upload(&upload).unwrap();
    let telemetry = record.telemetry();

    let shm_written = shm.exists();
    let _ = std::fs::remove_file(&shm);
    assert!(!shm_written, "script wrote {}", shm.display());
    assert!(!planted.exists());
    assert_eq!(telemetry.exit_status, ExitStatus::Success, "{}", telemetry.stderr_tail);
    assert_eq!(telemetry.stderr_tail.trim(), "denied,denied,denied,ok,1");

    let isolation = &telemetry.isolation;
    assert!(isolation.missing_controls.is_empty(), "{:?}", isolation);
    for control in ["mount_namespace", "masked_paths", "read_only_mounts"] {
        assert!(
            isolation.applied_controls.iter().any(|c| c == control),
            "{} not applied: {:?}",
            control,
            isolation
        );
    }
    let leftovers: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("run-other")]);
}

#[test]
fn sql_runner_behind_a_mask_still_starts() {
    require_user_namespaces!();
    let root = tempfile::Builder::new().tempdir_in("/tmp").unwrap();
    let orch = orchestrator(strict_config(root.path(), Path::new("/usr/bin/python3")));

    let upload = ScriptUpload::new(
        "alice",
        "ok.sql",
        FileKind::Sql,
        b"CREATE TABLE t(x); INSERT INTO t VALUES (1); SELECT x FROM t;".to_vec(),
    );
    let record = orch.analyze_upload(&upload).unwrap();
    let telemetry = record.telemetry();
    assert_eq!(telemetry.exit_status, ExitStatus::Success, "{}", telemetry.stderr_tail);
    assert!(telemetry.isolation.missing_controls.is_empty());
}
