use crate::config::types::{AnalysisRecord, Result, ScriptboxError};
use crate::store::{AdminCapability, RecordStore};
use std::sync::{Mutex, MutexGuard};

/// In-process record store for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<AnalysisRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<AnalysisRecord>>> {
        self.records
            .lock()
            .map_err(|_| ScriptboxError::Storage("record store lock poisoned".to_string()))
    }

    fn sorted(mut records: Vec<AnalysisRecord>) -> Vec<AnalysisRecord> {
        // Stable: equal timestamps keep insertion order
        records.sort_by_key(|record| record.created_at());
        records
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, record: &AnalysisRecord) -> Result<()> {
        let mut records = self.lock()?;
        if records.iter().any(|existing| existing.id() == record.id()) {
            return Err(ScriptboxError::Storage(format!(
                "record {} already stored",
                record.id()
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    fn history(&self, user_id: &str) -> Result<Vec<AnalysisRecord>> {
        let records = self.lock()?;
        Ok(Self::sorted(
            records
                .iter()
                .filter(|record| record.user_id() == user_id)
                .cloned()
                .collect(),
        ))
    }

    fn latest_for_file(&self, user_id: &str, filename: &str) -> Result<Option<AnalysisRecord>> {
        Ok(self
            .history(user_id)?
            .into_iter()
            .filter(|record| record.filename() == filename)
            .last())
    }

    fn all_records(&self, admin: &AdminCapability) -> Result<Vec<AnalysisRecord>> {
        log::info!(target: "scriptbox::audit", "{} listed all analysis records", admin.operator());
        Ok(Self::sorted(self.lock()?.clone()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::types::{
        ExecutionTelemetry, ExitStatus, FileKind, IsolationReport, PerformanceMetrics, RecordParts,
        ResourceLimits, RiskLevel, ScriptUpload,
    };
    use chrono::{Duration, TimeZone, Utc};

    /// A sealed record created `offset_secs` after a fixed base time
    pub(crate) fn sample_record(user: &str, filename: &str, offset_secs: i64) -> AnalysisRecord {
        let kind = if filename.ends_with(".sql") {
            FileKind::Sql
        } else {
            FileKind::Python
        };
        let upload = ScriptUpload::new(user, filename, kind, b"print('hi')".to_vec());
        let telemetry = ExecutionTelemetry {
            wall_time: 0.125,
            memory_peak: 4096,
            exit_status: ExitStatus::Success,
            exit_code: Some(0),
            signal: None,
            blocked_reason: None,
            stdout_bytes: 3,
            stderr_bytes: 0,
            output_truncated: false,
            stderr_tail: String::new(),
            limits: ResourceLimits::default(),
            isolation: IsolationReport::default(),
        };
        let metrics = PerformanceMetrics {
            execution_time: 0.125,
            peak_memory_bytes: 4096,
            peak_memory_mb: 4096.0 / 1048576.0,
            output_bytes: 3,
            throughput: Some(24.0),
            response_time_ms: Some(130.5),
            clamped: false,
        };
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        AnalysisRecord::seal(
            &upload,
            RecordParts {
                telemetry,
                metrics,
                findings: Vec::new(),
                static_score: 0,
                runtime_adjustment: 0,
                risk_level: RiskLevel::Low,
                created_at: base + Duration::seconds(offset_secs),
            },
        )
    }

    #[test]
    fn history_filters_by_user() {
        let store = MemoryStore::new();
        store.append(&sample_record("alice", "a.py", 3)).unwrap();
        store.append(&sample_record("bob", "b.py", 1)).unwrap();
        store.append(&sample_record("alice", "b.py", 2)).unwrap();

        let history = store.history("alice").unwrap();
        let names: Vec<_> = history.iter().map(|r| r.filename()).collect();
        assert_eq!(names, vec!["b.py", "a.py"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn latest_for_file_returns_newest() {
        let store = MemoryStore::new();
        store.append(&sample_record("alice", "a.py", 1)).unwrap();
        let newest = sample_record("alice", "a.py", 9);
        store.append(&newest).unwrap();
        assert_eq!(store.latest_for_file("alice", "a.py").unwrap(), Some(newest));
    }

    #[test]
    fn same_record_twice_is_rejected() {
        let store = MemoryStore::new();
        let record = sample_record("alice", "a.py", 0);
        store.append(&record).unwrap();
        assert!(store.append(&record).is_err());
    }
}
