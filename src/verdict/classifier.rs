/// Exit status classification
///
/// A pure function over the evidence of one run. Checks go from the most
/// specific cause to the least, so a run killed for its wall time is a
/// TIMEOUT even though it also died by signal.
use crate::config::types::{BlockedReason, ExitStatus, ResourceLimits};
use crate::exec::supervisor::{KillReason, RunEvidence};
use std::time::Duration;

/// Evidence gathered outside the supervisor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutcomeSignals {
    /// Combined output crossed the limit
    pub output_exceeded: bool,
    /// The runtime reported running out of memory on stderr
    pub memory_exhausted: bool,
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(
        evidence: &RunEvidence,
        limits: &ResourceLimits,
        signals: OutcomeSignals,
    ) -> (ExitStatus, Option<BlockedReason>) {
        match evidence.killed_for {
            Some(KillReason::WallTime) => return (ExitStatus::Timeout, None),
            Some(KillReason::Memory) => {
                return (ExitStatus::Blocked, Some(BlockedReason::MemoryLimit))
            }
            Some(KillReason::Output) => {
                return (ExitStatus::Blocked, Some(BlockedReason::OutputLimit))
            }
            // Cancelled runs never reach a record; treat a stray one as a crash
            Some(KillReason::Cancelled) => return (ExitStatus::Crashed, None),
            None => {}
        }

        match evidence.signal {
            Some(libc::SIGXCPU) => return (ExitStatus::Timeout, None),
            Some(libc::SIGXFSZ) => {
                return (ExitStatus::Blocked, Some(BlockedReason::FileSizeLimit))
            }
            _ => {}
        }

        if exceeds(evidence.wall_time, limits.max_wall_time) {
            return (ExitStatus::Timeout, None);
        }
        if evidence.memory_peak > limits.max_memory {
            return (ExitStatus::Blocked, Some(BlockedReason::MemoryLimit));
        }
        if signals.output_exceeded {
            return (ExitStatus::Blocked, Some(BlockedReason::OutputLimit));
        }
        if evidence.exit_code == Some(0) {
            return (ExitStatus::Success, None);
        }
        if signals.memory_exhausted {
            return (ExitStatus::Blocked, Some(BlockedReason::MemoryLimit));
        }
        (ExitStatus::Crashed, None)
    }
}

fn exceeds(used: Duration, limit: Duration) -> bool {
    used > limit
}
