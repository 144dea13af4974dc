//! Disposable SQL runner used by the sandbox.
//!
//! Executes one script against a fresh in-memory SQLite database and exits.
//! Never opens a file-backed database, and the script cannot attach one.

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::limits::Limit;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQL script to execute
    script: PathBuf,
}

/// In-memory connection with ATTACH disabled.
/// `VACUUM INTO` attaches its target internally, so the limit covers it too.
fn open_disposable() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
    anyhow::ensure!(
        conn.limit(Limit::SQLITE_LIMIT_ATTACHED) == 0,
        "could not disable ATTACH on the disposable database"
    );
    Ok(conn)
}

fn execute(script: &Path) -> Result<()> {
    let sql = std::fs::read_to_string(script)
        .with_context(|| format!("failed to read {}", script.display()))?;
    let conn = open_disposable()?;
    conn.execute_batch(&sql)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = execute(&args.script) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &Path, sql: &str) -> PathBuf {
        let path = dir.join("script.sql");
        std::fs::write(&path, sql).unwrap();
        path
    }

    #[test]
    fn runs_against_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "CREATE TABLE t(x); INSERT INTO t VALUES (1); SELECT * FROM t;",
        );
        execute(&path).unwrap();
    }

    #[test]
    fn attach_cannot_reach_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("host.db");
        let path = script(
            dir.path(),
            &format!(
                "ATTACH DATABASE '{}' AS h; CREATE TABLE h.t(x);",
                target.display()
            ),
        );
        assert!(execute(&path).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn vacuum_into_cannot_write_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.db");
        let path = script(
            dir.path(),
            &format!("CREATE TABLE t(x); VACUUM INTO '{}';", target.display()),
        );
        assert!(execute(&path).is_err());
        assert!(!target.exists());
    }
}
