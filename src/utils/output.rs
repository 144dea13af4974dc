/// Bounded output collection
///
/// One reader thread per stream. Both streams share a byte budget; once it is
/// spent the collector raises a flag the supervisor polls, and keeps draining
/// without storing so the child never blocks on a full pipe before it is killed.
use crossbeam_channel::{bounded, Receiver};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What one reader thread saw
#[derive(Debug, Default)]
struct StreamResult {
    bytes: u64,
    tail: Vec<u8>,
}

/// Summary of everything a run wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSummary {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Combined output went over the limit, or a reader had to be abandoned
    pub truncated: bool,
    pub stderr_tail: String,
}

pub struct OutputCollector {
    exceeded: Arc<AtomicBool>,
    stdout_rx: Option<Receiver<StreamResult>>,
    stderr_rx: Option<Receiver<StreamResult>>,
}

impl OutputCollector {
    /// Start draining `stdout` and `stderr` against a combined byte limit.
    /// Only the last `tail_bytes` of stderr are retained.
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, limit: u64, tail_bytes: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let total = Arc::new(AtomicU64::new(0));
        let exceeded = Arc::new(AtomicBool::new(false));

        let stdout_rx = stdout.map(|stream| {
            spawn_reader(stream, limit, 0, Arc::clone(&total), Arc::clone(&exceeded))
        });
        let stderr_rx = stderr.map(|stream| {
            spawn_reader(stream, limit, tail_bytes, Arc::clone(&total), Arc::clone(&exceeded))
        });

        Self {
            exceeded,
            stdout_rx,
            stderr_rx,
        }
    }

    /// Whether the combined limit has been crossed
    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    /// Wait for both readers to hit EOF.
    ///
    /// A reader still blocked after `grace` (an escaped descendant holding the
    /// pipe open) is abandoned and the output is marked truncated.
    pub fn finish(self, grace: Duration) -> OutputSummary {
        let deadline = Instant::now() + grace;
        let mut abandoned = false;

        let mut wait = |rx: Option<Receiver<StreamResult>>| -> StreamResult {
            let Some(rx) = rx else {
                return StreamResult::default();
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(result) => result,
                Err(_) => {
                    abandoned = true;
                    StreamResult::default()
                }
            }
        };

        let stdout = wait(self.stdout_rx);
        let stderr = wait(self.stderr_rx);
        if abandoned {
            log::warn!("Output reader did not reach EOF within {:?}; abandoning it", grace);
        }

        OutputSummary {
            stdout_bytes: stdout.bytes,
            stderr_bytes: stderr.bytes,
            truncated: abandoned || self.exceeded.load(Ordering::Acquire),
            stderr_tail: String::from_utf8_lossy(&stderr.tail).into_owned(),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut stream: R,
    limit: u64,
    tail_bytes: usize,
    total: Arc<AtomicU64>,
    exceeded: Arc<AtomicBool>,
) -> Receiver<StreamResult> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut result = StreamResult::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Output stream read failed: {}", e);
                    break;
                }
            };
            result.bytes += n as u64;
            let seen = total.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
            if seen > limit {
                exceeded.store(true, Ordering::Release);
            }
            if tail_bytes > 0 {
                result.tail.extend_from_slice(&chunk[..n]);
                if result.tail.len() > tail_bytes {
                    let excess = result.tail.len() - tail_bytes;
                    result.tail.drain(..excess);
                }
            }
        }
        let _ = tx.send(result);
    });
    rx
}
