/// Analysis orchestration
///
/// One call takes one upload through static analysis and sandboxed execution
/// in parallel, assembles the record and stores it before returning.
use crate::analyzer::{score, SecurityAnalyzer};
use crate::config::loader::AnalyzerConfig;
use crate::config::types::{
    AnalysisRecord, ExecutionTelemetry, RecordParts, ResourceLimits, Result, RiskLevel,
    ScriptUpload, ScriptboxError,
};
use crate::config::validator::validate_config;
use crate::exec::{CancelToken, SandboxExecutor, SandboxPool, ScriptExecutor};
use crate::observability::audit;
use crate::observability::metrics::get_metrics;
use crate::performance;
use crate::pipeline::clock::RecordClock;
use crate::store::RecordStore;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Added to the static score when the run itself crashed or was blocked
pub const RUNTIME_PENALTY: u32 = 5;

pub struct Orchestrator {
    config: AnalyzerConfig,
    executor: Arc<dyn ScriptExecutor>,
    analyzer: Arc<SecurityAnalyzer>,
    pool: SandboxPool,
    store: Arc<dyn RecordStore>,
    clock: RecordClock,
}

impl Orchestrator {
    pub fn new(
        config: AnalyzerConfig,
        executor: Arc<dyn ScriptExecutor>,
        analyzer: Arc<SecurityAnalyzer>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let pool = SandboxPool::new(config.max_concurrent_sandboxes);
        Self {
            config,
            executor,
            analyzer,
            pool,
            store,
            clock: RecordClock::new(),
        }
    }

    /// Validate `config` and wire up the process sandbox and rule sets
    pub fn from_config(config: AnalyzerConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        validate_config(&config)?;
        let executor = Arc::new(SandboxExecutor::new(config.clone()));
        let analyzer = Arc::new(SecurityAnalyzer::new()?);
        Ok(Self::new(config, executor, analyzer, store))
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn analyze_upload(&self, script: &ScriptUpload) -> Result<AnalysisRecord> {
        self.analyze_upload_with_cancel(script, &CancelToken::new())
    }

    pub fn analyze_upload_with_cancel(
        &self,
        script: &ScriptUpload,
        cancel: &CancelToken,
    ) -> Result<AnalysisRecord> {
        let entered = Instant::now();
        let metrics = get_metrics();
        metrics.analyses_started.inc();
        log::info!(
            "Analyzing {} ({}, {} bytes) for {}",
            script.filename(),
            script.kind(),
            script.content().len(),
            script.user_id()
        );

        let _permit = self
            .pool
            .acquire(self.config.sandbox_acquire_timeout())
            .inspect_err(|e| {
                if matches!(e, ScriptboxError::SandboxBusy { .. }) {
                    metrics.sandbox_busy.inc();
                }
            })?;
        metrics.active_sandboxes.inc();
        let outcome = self.run_with_permit(script, cancel, entered);
        metrics.active_sandboxes.dec();
        outcome
    }

    fn run_with_permit(
        &self,
        script: &ScriptUpload,
        cancel: &CancelToken,
        entered: Instant,
    ) -> Result<AnalysisRecord> {
        let limits = self.config.resource_limits();

        let (report, telemetry) = thread::scope(|scope| {
            let analysis = scope.spawn(|| self.analyzer.analyze(script));
            let telemetry = self.execute_with_retry(script, &limits, cancel);
            (analysis.join(), telemetry)
        });
        let report = report
            .map_err(|_| ScriptboxError::AnalysisFailed("static analysis panicked".to_string()))?;
        let telemetry = telemetry?;

        let runtime_adjustment = if telemetry.exit_status.is_unsafe_outcome() {
            RUNTIME_PENALTY
        } else {
            0
        };
        let final_score = report.score + runtime_adjustment;
        let risk_level = score::risk_level(final_score, &report.findings);
        let metrics = performance::derive(&telemetry).with_response_time(entered.elapsed());

        let record = AnalysisRecord::seal(
            script,
            RecordParts {
                telemetry,
                metrics,
                findings: report.findings,
                static_score: report.score,
                runtime_adjustment,
                risk_level,
                created_at: self.clock.now(),
            },
        );

        self.store.append(&record).map_err(|e| {
            get_metrics().storage_failures.inc();
            log::error!("Failed to store record {}: {}", record.id(), e);
            match e {
                ScriptboxError::Storage(_) => e,
                other => ScriptboxError::Storage(other.to_string()),
            }
        })?;

        get_metrics().analyses_completed.inc();
        if risk_level >= RiskLevel::High {
            audit::events::high_risk_script(
                script.id(),
                script.user_id(),
                script.filename(),
                record.risk_score(),
            );
        }
        log::info!("{}", record.summary());
        Ok(record)
    }

    /// Run the script, retrying once if the sandbox could not be set up
    fn execute_with_retry(
        &self,
        script: &ScriptUpload,
        limits: &ResourceLimits,
        cancel: &CancelToken,
    ) -> Result<ExecutionTelemetry> {
        let first = match self.executor.execute_with_cancel(script, limits, cancel) {
            Err(ScriptboxError::SandboxUnavailable(cause)) => cause,
            other => return other,
        };

        get_metrics().retries.inc();
        let backoff = jittered(self.config.retry_backoff());
        log::warn!(
            "Sandbox unavailable for {} ({}); retrying in {:?}",
            script.filename(),
            first,
            backoff
        );
        sleep_unless_cancelled(backoff, cancel)?;

        match self.executor.execute_with_cancel(script, limits, cancel) {
            Err(ScriptboxError::SandboxUnavailable(second)) => {
                Err(ScriptboxError::AnalysisFailed(format!(
                    "sandbox unavailable after retry: {} (first attempt: {})",
                    second, first
                )))
            }
            other => other,
        }
    }
}

/// Backoff plus up to half of it again, so concurrent retries spread out
fn jittered(backoff: Duration) -> Duration {
    let base = backoff.as_millis() as u64;
    Duration::from_millis(base + fastrand::u64(0..=base / 2))
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            get_metrics().cancellations.inc();
            return Err(ScriptboxError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(Duration::from_millis(10)));
    }
}
