//! Record store integration tests
//!
//! Drive the orchestrator against a file-backed SQLite store with an
//! in-process executor, then reopen the database to check what persisted.

use scriptbox::analyzer::SecurityAnalyzer;
use scriptbox::config::loader::AnalyzerConfig;
use scriptbox::store::{AdminCapability, RecordStore, SqliteStore};
use scriptbox::{
    CancelToken, ExecutionTelemetry, ExitStatus, FileKind, IsolationReport, Orchestrator,
    ResourceLimits, Result, ScriptExecutor, ScriptUpload,
};
use std::sync::Arc;

struct InstantExecutor;

impl ScriptExecutor for InstantExecutor {
    fn execute_with_cancel(
        &self,
        _script: &ScriptUpload,
        limits: &ResourceLimits,
        _cancel: &CancelToken,
    ) -> Result<ExecutionTelemetry> {
        Ok(ExecutionTelemetry {
            wall_time: 0.01,
            memory_peak: 4 << 20,
            exit_status: ExitStatus::Success,
            exit_code: Some(0),
            signal: None,
            blocked_reason: None,
            stdout_bytes: 6,
            stderr_bytes: 0,
            output_truncated: false,
            stderr_tail: String::new(),
            limits: limits.clone(),
            isolation: IsolationReport::default(),
        })
    }
}

fn orchestrator(store: Arc<SqliteStore>) -> Orchestrator {
    Orchestrator::new(
        AnalyzerConfig::default(),
        Arc::new(InstantExecutor),
        Arc::new(SecurityAnalyzer::new().unwrap()),
        store,
    )
}

fn upload(user: &str, filename: &str, source: &str) -> ScriptUpload {
    let kind = if filename.ends_with(".sql") {
        FileKind::Sql
    } else {
        FileKind::Python
    };
    ScriptUpload::new(user, filename, kind, source.as_bytes().to_vec())
}

#[test]
fn history_survives_reopen_in_analysis_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("records").join("scriptbox.db");

    let mut ids = Vec::new();
    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let orch = orchestrator(store);
        for (name, source) in [
            ("a.py", "print(1)\n"),
            ("b.sql", "DELETE FROM t;"),
            ("a.py", "import os\nos.system('ls')\n"),
        ] {
            ids.push(orch.analyze_upload(&upload("alice", name, source)).unwrap().id());
        }
        orch.analyze_upload(&upload("bob", "c.py", "print(2)\n")).unwrap();
    }

    let store = SqliteStore::open(&db).unwrap();
    let history = store.history("alice").unwrap();
    let stored: Vec<_> = history.iter().map(|r| r.id()).collect();
    assert_eq!(stored, ids);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].created_at() < pair[1].created_at()));

    let latest = store.latest_for_file("alice", "a.py").unwrap().unwrap();
    assert_eq!(latest.id(), ids[2]);
    assert!(latest.risk_score() > 0);

    assert_eq!(store.history("bob").unwrap().len(), 1);
    assert!(store.history("carol").unwrap().is_empty());

    let everything = store.all_records(&AdminCapability::grant("ops")).unwrap();
    assert_eq!(everything.len(), 4);
}

#[test]
fn stored_rows_cannot_be_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("scriptbox.db");

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let record = orchestrator(store.clone())
        .analyze_upload(&upload("alice", "job.py", "print(1)\n"))
        .unwrap();

    let conn = rusqlite::Connection::open(&db).unwrap();
    let update = conn.execute(
        "UPDATE analysis_records SET risk_score = 0 WHERE id = ?1",
        [record.id().to_string()],
    );
    assert!(update.is_err());
    let delete = conn.execute("DELETE FROM analysis_records", []);
    assert!(delete.is_err());
    drop(conn);

    assert_eq!(store.history("alice").unwrap(), vec![record]);
}

#[test]
fn duplicate_record_is_rejected() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let record = orchestrator(store.clone())
        .analyze_upload(&upload("alice", "job.py", "print(1)\n"))
        .unwrap();

    assert!(store.append(&record).is_err());
    assert_eq!(store.history("alice").unwrap().len(), 1);
}
