/// Bounded sandbox capacity
///
/// A fixed number of tokens circulate through a channel. Holding a permit
/// means holding a token; dropping the permit puts it back.
use crate::config::types::{Result, ScriptboxError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

pub struct SandboxPool {
    capacity: usize,
    tokens: Receiver<()>,
    returns: Sender<()>,
}

/// Right to run one sandbox. Released on drop.
#[derive(Debug)]
pub struct SandboxPermit {
    returns: Sender<()>,
}

impl Drop for SandboxPermit {
    fn drop(&mut self) {
        if self.returns.try_send(()).is_err() {
            log::error!("Sandbox pool token could not be returned");
        }
    }
}

impl SandboxPool {
    pub fn new(capacity: usize) -> Self {
        let (returns, tokens) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel was sized for exactly these tokens
            let _ = returns.try_send(());
        }
        Self {
            capacity,
            tokens,
            returns,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.tokens.len()
    }

    /// Wait up to `timeout` for a free sandbox. A zero timeout never blocks.
    pub fn acquire(&self, timeout: Duration) -> Result<SandboxPermit> {
        let started = Instant::now();
        let acquired = if timeout.is_zero() {
            match self.tokens.try_recv() {
                Ok(()) => true,
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Disconnected) => return Err(disconnected()),
            }
        } else {
            match self.tokens.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => return Err(disconnected()),
            }
        };

        if !acquired {
            let waited = started.elapsed();
            log::warn!("No sandbox free after {:?} ({} in use)", waited, self.capacity);
            return Err(ScriptboxError::SandboxBusy { waited });
        }
        Ok(SandboxPermit {
            returns: self.returns.clone(),
        })
    }
}

fn disconnected() -> ScriptboxError {
    ScriptboxError::SandboxUnavailable("sandbox pool is closed".to_string())
}
