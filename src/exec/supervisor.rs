/// Supervision of one running script
///
/// Polls the child with wait4(WNOHANG) every 10ms, sampling the leader's peak
/// RSS from /proc and the memory of the whole script tree through a
/// `MemorySource`. Any limit crossing or cancellation kills the process group.
use crate::config::types::{ResourceLimits, Result, ScriptboxError};
use crate::exec::cancel::CancelToken;
use crate::exec::memory::MemorySource;
use crate::observability::audit;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why the supervisor killed the script
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KillReason {
    WallTime,
    Memory,
    Output,
    Cancelled,
}

impl KillReason {
    fn describe(self) -> &'static str {
        match self {
            KillReason::WallTime => "wall time limit reached",
            KillReason::Memory => "memory limit exceeded",
            KillReason::Output => "output limit exceeded",
            KillReason::Cancelled => "execution cancelled",
        }
    }
}

/// Immutable facts gathered while the script ran
#[derive(Clone, Debug, PartialEq)]
pub struct RunEvidence {
    pub wall_time: Duration,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Peak memory of the script tree in bytes
    pub memory_peak: u64,
    pub killed_for: Option<KillReason>,
}

/// Watch `pid` until it exits, enforcing `limits`.
///
/// `output_exceeded` is polled each tick, `memory` every `memory.interval()`
/// ticks. The process group is killed once
/// more after reaping so no descendant outlives the run.
pub fn supervise(
    pid: i32,
    run_id: Uuid,
    limits: &ResourceLimits,
    started: Instant,
    cancel: &CancelToken,
    memory: &MemorySource<'_>,
    output_exceeded: impl Fn() -> bool,
) -> Result<RunEvidence> {
    let mut memory_peak = 0u64;
    let mut tick = 0u32;
    let mut killed_for: Option<KillReason> = None;

    let (status, usage) = loop {
        match wait4(pid, libc::WNOHANG) {
            Ok(Some(reaped)) => break reaped,
            Ok(None) => {}
            Err(e) => {
                kill_group(pid);
                return Err(ScriptboxError::SandboxUnavailable(format!(
                    "wait4({}) failed: {}",
                    pid, e
                )));
            }
        }

        if let Some(rss) = read_peak_rss(pid) {
            memory_peak = memory_peak.max(rss);
        }
        if tick % memory.interval() == 0 {
            if let Some(total) = memory.sample() {
                memory_peak = memory_peak.max(total);
            }
        }
        tick = tick.wrapping_add(1);

        let reason = if cancel.is_cancelled() {
            Some(KillReason::Cancelled)
        } else if started.elapsed() >= limits.max_wall_time {
            Some(KillReason::WallTime)
        } else if memory_peak > limits.max_memory {
            Some(KillReason::Memory)
        } else if output_exceeded() {
            Some(KillReason::Output)
        } else {
            None
        };

        if let Some(reason) = reason {
            log::info!("Run {}: {}; killing process group {}", run_id, reason.describe(), pid);
            kill_group(pid);
            audit::events::forced_kill(run_id, pid, reason.describe());
            killed_for = Some(reason);
            break blocking_reap(pid)?;
        }

        std::thread::sleep(POLL_INTERVAL);
    };
    let wall_time = started.elapsed();

    // Stragglers that inherited the group
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);

    let (exit_code, signal) = decode_status(status);
    let reported_rss = (usage.ru_maxrss.max(0) as u64).saturating_mul(1024);

    Ok(RunEvidence {
        wall_time,
        exit_code,
        signal,
        memory_peak: memory_peak.max(reported_rss),
        killed_for,
    })
}

/// SIGKILL the process group led by `pid`, falling back to the pid alone
pub fn kill_group(pid: i32) {
    let target = Pid::from_raw(pid);
    if let Err(group_err) = killpg(target, Signal::SIGKILL) {
        if let Err(e) = kill(target, Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                log::warn!("Failed to kill process {}: {} (group: {})", pid, e, group_err);
            }
        }
    }
}

fn wait4(pid: i32, flags: libc::c_int) -> std::io::Result<Option<(libc::c_int, libc::rusage)>> {
    loop {
        let mut status: libc::c_int = 0;
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        let rc = unsafe { libc::wait4(pid, &mut status, flags, usage.as_mut_ptr()) };
        if rc == pid {
            return Ok(Some((status, unsafe { usage.assume_init() })));
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn blocking_reap(pid: i32) -> Result<(libc::c_int, libc::rusage)> {
    match wait4(pid, 0) {
        Ok(Some(reaped)) => Ok(reaped),
        Ok(None) => Err(ScriptboxError::SandboxUnavailable(format!(
            "wait4({}) returned without a status",
            pid
        ))),
        Err(e) => Err(ScriptboxError::SandboxUnavailable(format!(
            "wait4({}) failed after kill: {}",
            pid, e
        ))),
    }
}

fn decode_status(status: libc::c_int) -> (Option<i32>, Option<i32>) {
    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    }
}

/// VmHWM of a live process in bytes
fn read_peak_rss(pid: i32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_hwm(&status)
}

fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kb: u64 = line
        .trim_start_matches("VmHWM:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn parses_vm_hwm() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmHWM:\t    8192 kB\nVmRSS:\t 4096 kB\n";
        assert_eq!(parse_vm_hwm(status), Some(8192 * 1024));
        assert_eq!(parse_vm_hwm("Name:\tzombie\n"), None);
    }

    #[test]
    fn decodes_exit_and_signal() {
        // exit(3) encodes as 3 << 8; SIGKILL death as the bare signal number
        assert_eq!(decode_status(3 << 8), (Some(3), None));
        assert_eq!(decode_status(libc::SIGKILL), (None, Some(libc::SIGKILL)));
    }

    #[test]
    fn supervises_quick_exit() {
        let child = Command::new("/bin/sh").args(["-c", "exit 4"]).spawn().unwrap();
        let evidence = supervise(
            child.id() as i32,
            Uuid::new_v4(),
            &ResourceLimits::default(),
            Instant::now(),
            &CancelToken::new(),
            &MemorySource::Session(-1),
            || false,
        )
        .unwrap();
        assert_eq!(evidence.exit_code, Some(4));
        assert_eq!(evidence.killed_for, None);
    }

    #[test]
    fn kills_on_wall_time() {
        let child = Command::new("/bin/sh").args(["-c", "exec sleep 5"]).spawn().unwrap();
        let limits = ResourceLimits {
            max_wall_time: Duration::from_millis(100),
            ..ResourceLimits::default()
        };
        let evidence = supervise(
            child.id() as i32,
            Uuid::new_v4(),
            &limits,
            Instant::now(),
            &CancelToken::new(),
            &MemorySource::Session(-1),
            || false,
        )
        .unwrap();
        assert_eq!(evidence.killed_for, Some(KillReason::WallTime));
        assert_eq!(evidence.signal, Some(libc::SIGKILL));
        assert!(evidence.wall_time < Duration::from_secs(4));
    }

    #[test]
    fn cancellation_kills_the_run() {
        let child = Command::new("/bin/sh").args(["-c", "exec sleep 5"]).spawn().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let evidence = supervise(
            child.id() as i32,
            Uuid::new_v4(),
            &ResourceLimits::default(),
            Instant::now(),
            &cancel,
            &MemorySource::Session(-1),
            || false,
        )
        .unwrap();
        assert_eq!(evidence.killed_for, Some(KillReason::Cancelled));
    }
}
