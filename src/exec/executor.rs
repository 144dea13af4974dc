/// Sandboxed script execution
///
/// One call runs one script in a fresh workspace and returns its telemetry.
/// Limit violations and crashes are outcomes, not errors; only a sandbox that
/// could not be set up (or a cancelled run) produces `Err`.
use crate::config::loader::AnalyzerConfig;
use crate::config::types::{
    BlockedReason, ExecutionTelemetry, ExitStatus, IsolationReport, ResourceLimits, Result,
    ScriptUpload, ScriptboxError,
};
use crate::exec::cancel::CancelToken;
use crate::exec::cgroup::MemoryCgroup;
use crate::exec::memory::MemorySource;
use crate::exec::preexec::{PreExecPlan, CGROUP_CONTROL};
use crate::exec::supervisor::{self, KillReason};
use crate::observability::audit;
use crate::observability::metrics::get_metrics;
use crate::runtime::{runtime_for, ScriptRuntime};
use crate::safety::workspace::Workspace;
use crate::utils::output::OutputCollector;
use crate::verdict::{OutcomeSignals, VerdictClassifier};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use uuid::Uuid;

const OUTPUT_GRACE: Duration = Duration::from_millis(500);
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Executes one script under resource limits
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &ScriptUpload, limits: &ResourceLimits) -> Result<ExecutionTelemetry> {
        self.execute_with_cancel(script, limits, &CancelToken::new())
    }

    fn execute_with_cancel(
        &self,
        script: &ScriptUpload,
        limits: &ResourceLimits,
        cancel: &CancelToken,
    ) -> Result<ExecutionTelemetry>;
}

/// Process sandbox: rlimits plus, where the kernel allows, user/mount/net namespaces
pub struct SandboxExecutor {
    config: AnalyzerConfig,
}

impl SandboxExecutor {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn run_in_workspace(
        &self,
        workspace: &mut Workspace,
        runtime: &dyn ScriptRuntime,
        script: &ScriptUpload,
        limits: &ResourceLimits,
        cancel: &CancelToken,
    ) -> Result<ExecutionTelemetry> {
        let run_id = workspace.run_id();
        if cancel.is_cancelled() {
            audit::events::execution_cancelled(run_id);
            return Err(ScriptboxError::Cancelled);
        }

        let script_path = workspace.write_script(&runtime.script_name(), script.content())?;
        audit::events::execution_start(run_id, script.id(), script.user_id(), script.kind());

        let started = Instant::now();
        let (mut child, isolation, cgroup) =
            self.spawn_isolated(run_id, runtime, workspace.run_dir(), &script_path, limits)?;
        let pid = child.id() as i32;
        log::debug!("Run {} started as pid {}", run_id, pid);

        // The child called setsid(), so its session id is its pid
        let memory = match &cgroup {
            Some(cgroup) => MemorySource::Cgroup(cgroup),
            None => MemorySource::Session(pid),
        };

        let collector = OutputCollector::start(
            child.stdout.take(),
            child.stderr.take(),
            limits.max_output_size,
            self.config.stderr_tail_bytes,
        );
        let evidence = supervisor::supervise(pid, run_id, limits, started, cancel, &memory, || {
            collector.exceeded()
        });
        if let Some(cgroup) = &cgroup {
            cgroup.kill_all();
        }
        let output = collector.finish(OUTPUT_GRACE);
        let mut evidence = evidence?;

        let mut oom_killed = false;
        if let Some(mut cgroup) = cgroup {
            if let Some(peak) = cgroup.peak() {
                evidence.memory_peak = evidence.memory_peak.max(peak);
            }
            oom_killed = cgroup.oom_killed();
            if let Err(e) = cgroup.remove() {
                log::error!("Run {}: {}", run_id, e);
            }
        }

        if evidence.killed_for == Some(KillReason::Cancelled) {
            audit::events::execution_cancelled(run_id);
            get_metrics().cancellations.inc();
            return Err(ScriptboxError::Cancelled);
        }

        let signals = OutcomeSignals {
            output_exceeded: output.stdout_bytes + output.stderr_bytes > limits.max_output_size,
            memory_exhausted: oom_killed || runtime.memory_exhausted(&output.stderr_tail),
        };
        let (exit_status, blocked_reason) = VerdictClassifier::classify(&evidence, limits, signals);

        match (exit_status, blocked_reason) {
            (ExitStatus::Timeout, _) => {
                audit::events::wall_time_exceeded(run_id, limits.max_wall_time)
            }
            (ExitStatus::Blocked, Some(reason)) => {
                let limit = match reason {
                    BlockedReason::MemoryLimit => limits.max_memory,
                    _ => limits.max_output_size,
                };
                audit::events::limit_blocked(run_id, reason, limit)
            }
            _ => {}
        }

        let telemetry = ExecutionTelemetry {
            wall_time: evidence.wall_time.as_secs_f64(),
            memory_peak: evidence.memory_peak,
            exit_status,
            exit_code: evidence.exit_code,
            signal: evidence.signal,
            blocked_reason,
            stdout_bytes: output.stdout_bytes,
            stderr_bytes: output.stderr_bytes,
            output_truncated: output.truncated,
            stderr_tail: output.stderr_tail,
            limits: limits.clone(),
            isolation,
        };
        get_metrics().record_exit_status(exit_status);
        audit::events::execution_end(
            run_id,
            exit_status,
            telemetry.wall_time,
            telemetry.isolation.is_degraded(),
        );
        log::info!("Run {}: {}", run_id, telemetry.summary());
        Ok(telemetry)
    }

    /// Per-run memory cgroup, when a cgroup parent is configured
    ///
    /// `Ok(None)` with a missing-control entry when permissive mode carries on
    /// without one.
    fn memory_cgroup(
        &self,
        run_id: Uuid,
        limits: &ResourceLimits,
        missing: &mut Vec<String>,
    ) -> Result<Option<MemoryCgroup>> {
        let Some(parent) = &self.config.cgroup_parent else {
            return Ok(None);
        };
        match MemoryCgroup::create(parent, run_id, limits.max_memory, self.config.max_processes) {
            Ok(cgroup) => Ok(Some(cgroup)),
            Err(e) if self.config.is_strict() => {
                audit::events::sandbox_unavailable(run_id, &e.to_string());
                get_metrics().sandbox_unavailable.inc();
                Err(e)
            }
            Err(e) => {
                log::warn!("Run {}: {}; memory is sampled per session instead", run_id, e);
                let control = vec![CGROUP_CONTROL.to_string()];
                audit::events::control_degraded(run_id, &control, &e.to_string());
                get_metrics().degraded_runs.inc();
                missing.extend(control);
                Ok(None)
            }
        }
    }

    /// Spawn with full isolation, degrading to rlimits only in permissive mode
    fn spawn_isolated(
        &self,
        run_id: Uuid,
        runtime: &dyn ScriptRuntime,
        run_dir: &Path,
        script_path: &Path,
        limits: &ResourceLimits,
    ) -> Result<(Child, IsolationReport, Option<MemoryCgroup>)> {
        let mut missing = Vec::new();
        let cgroup = self.memory_cgroup(run_id, limits, &mut missing)?;
        let program = runtime
            .command(script_path)
            .first()
            .map(PathBuf::from)
            .unwrap_or_default();

        let plan = PreExecPlan::build(
            limits,
            &self.config,
            run_dir,
            &program,
            true,
            cgroup.as_ref().map(|c| c.procs_path()).as_deref(),
        )?;
        let mut applied = plan.applied_controls();
        applied.push("scrubbed_env".to_string());

        let first_error = match self.spawn(runtime, run_dir, script_path, plan) {
            Ok(child) => {
                let isolation = IsolationReport {
                    applied_controls: applied,
                    missing_controls: missing,
                };
                return Ok((child, isolation, cgroup));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.unavailable(run_id, runtime, &e));
            }
            Err(e) => e,
        };

        if self.config.is_strict() {
            let cause = format!("namespace isolation could not be set up: {}", first_error);
            audit::events::sandbox_unavailable(run_id, &cause);
            get_metrics().sandbox_unavailable.inc();
            return Err(ScriptboxError::SandboxUnavailable(cause));
        }

        let mut degraded = PreExecPlan::namespace_controls();
        if cgroup.is_some() {
            degraded.push(CGROUP_CONTROL.to_string());
        }
        log::warn!(
            "Run {}: namespace isolation failed ({}); continuing with rlimits only",
            run_id,
            first_error
        );
        audit::events::control_degraded(run_id, &degraded, &first_error.to_string());
        get_metrics().degraded_runs.inc();
        missing.extend(degraded);
        drop(cgroup);

        let plan = PreExecPlan::build(limits, &self.config, run_dir, &program, false, None)?;
        let mut applied = plan.applied_controls();
        applied.push("scrubbed_env".to_string());
        match self.spawn(runtime, run_dir, script_path, plan) {
            Ok(child) => Ok((
                child,
                IsolationReport {
                    applied_controls: applied,
                    missing_controls: missing,
                },
                None,
            )),
            Err(e) => Err(self.unavailable(run_id, runtime, &e)),
        }
    }

    fn spawn(
        &self,
        runtime: &dyn ScriptRuntime,
        run_dir: &Path,
        script_path: &Path,
        plan: PreExecPlan,
    ) -> io::Result<Child> {
        let argv = runtime.command(script_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", run_dir)
            .env("TMPDIR", run_dir)
            .env("LANG", "C.UTF-8")
            .envs(runtime.environment(run_dir))
            .current_dir(run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            command.pre_exec(move || plan.apply());
        }
        command.spawn()
    }

    fn unavailable(&self, run_id: Uuid, runtime: &dyn ScriptRuntime, err: &io::Error) -> ScriptboxError {
        let program = runtime
            .command(Path::new(""))
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cause = format!("failed to start {} runtime {}: {}", runtime.kind(), program, err);
        audit::events::sandbox_unavailable(run_id, &cause);
        get_metrics().sandbox_unavailable.inc();
        ScriptboxError::SandboxUnavailable(cause)
    }
}

impl ScriptExecutor for SandboxExecutor {
    fn execute_with_cancel(
        &self,
        script: &ScriptUpload,
        limits: &ResourceLimits,
        cancel: &CancelToken,
    ) -> Result<ExecutionTelemetry> {
        let runtime = runtime_for(script.kind(), &self.config);
        let mut workspace = Workspace::create(&self.config.workspace_root)?;
        let outcome = self.run_in_workspace(&mut workspace, runtime.as_ref(), script, limits, cancel);
        if let Err(e) = workspace.cleanup() {
            log::error!(
                "Failed to remove workspace {}: {}",
                workspace.run_dir().display(),
                e
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::IsolationMode;
    use crate::config::types::FileKind;
    use std::path::PathBuf;

    fn executor(root: &Path, interpreter: &str) -> SandboxExecutor {
        SandboxExecutor::new(AnalyzerConfig {
            workspace_root: root.to_path_buf(),
            python_interpreter: PathBuf::from(interpreter),
            isolation: IsolationMode::Permissive,
            ..AnalyzerConfig::default()
        })
    }

    #[test]
    fn missing_interpreter_is_unavailable_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), "/nonexistent/python3");
        let script = ScriptUpload::new("u", "a.py", FileKind::Python, b"print(1)".to_vec());
        let err = exec.execute(&script, &ResourceLimits::default()).unwrap_err();
        assert!(matches!(err, ScriptboxError::SandboxUnavailable(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancelled_before_start_never_spawns() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), "/nonexistent/python3");
        let script = ScriptUpload::new("u", "a.py", FileKind::Python, b"print(1)".to_vec());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = exec
            .execute_with_cancel(&script, &ResourceLimits::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, ScriptboxError::Cancelled));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
