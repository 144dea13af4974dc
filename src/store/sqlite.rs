use crate::config::types::{AnalysisRecord, Result, ScriptboxError};
use crate::store::{AdminCapability, RecordStore};
use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-backed record store. Append-only is enforced by triggers.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS analysis_records (
      seq INTEGER PRIMARY KEY AUTOINCREMENT,
      id TEXT NOT NULL UNIQUE,
      user_id TEXT NOT NULL,
      filename TEXT NOT NULL,
      created_at TEXT NOT NULL,
      exit_status TEXT NOT NULL,
      risk_score INTEGER NOT NULL,
      record_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_analysis_records_user
      ON analysis_records(user_id, created_at, seq);

    CREATE TRIGGER IF NOT EXISTS analysis_records_no_update
      BEFORE UPDATE ON analysis_records
    BEGIN
      SELECT RAISE(ABORT, 'analysis records are append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS analysis_records_no_delete
      BEFORE DELETE ON analysis_records
    BEGIN
      SELECT RAISE(ABORT, 'analysis records are append-only');
    END;
"#;

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ScriptboxError::Storage("record store lock poisoned".to_string()))
    }

    fn query_records(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AnalysisRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }
}

fn timestamp_key(record: &AnalysisRecord) -> String {
    // Fixed-width UTC so lexical order is chronological
    record
        .created_at()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl RecordStore for SqliteStore {
    fn append(&self, record: &AnalysisRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.lock()?.execute(
            r#"
            INSERT INTO analysis_records
              (id, user_id, filename, created_at, exit_status, risk_score, record_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id().to_string(),
                record.user_id(),
                record.filename(),
                timestamp_key(record),
                record.telemetry().exit_status.as_str(),
                record.risk_score() as i64,
                json
            ],
        )?;
        log::debug!("Stored record {} for {}", record.id(), record.user_id());
        Ok(())
    }

    fn history(&self, user_id: &str) -> Result<Vec<AnalysisRecord>> {
        self.query_records(
            "SELECT record_json FROM analysis_records WHERE user_id = ?1 ORDER BY created_at, seq",
            &[&user_id],
        )
    }

    fn latest_for_file(&self, user_id: &str, filename: &str) -> Result<Option<AnalysisRecord>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                r#"
                SELECT record_json FROM analysis_records
                WHERE user_id = ?1 AND filename = ?2
                ORDER BY created_at DESC, seq DESC
                LIMIT 1
                "#,
                params![user_id, filename],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| serde_json::from_str(&json).map_err(ScriptboxError::from))
            .transpose()
    }

    fn all_records(&self, admin: &AdminCapability) -> Result<Vec<AnalysisRecord>> {
        log::info!(target: "scriptbox::audit", "{} listed all analysis records", admin.operator());
        self.query_records(
            "SELECT record_json FROM analysis_records ORDER BY created_at, seq",
            &[],
        )
    }
}
