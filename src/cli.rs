use crate::config::loader::{AnalyzerConfig, IsolationMode};
use crate::config::types::ScriptboxError;
use crate::config::validator::check_system_capabilities;
use crate::intake;
use crate::observability::{audit, metrics::get_metrics};
use crate::pipeline::Orchestrator;
use crate::store::{AdminCapability, RecordStore, SqliteStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exit code for failures worth retrying later (EX_TEMPFAIL)
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a Python or SQL script and store the report
    Analyze {
        /// User the upload belongs to
        #[arg(long)]
        user: String,
        /// Script to analyze (.py or .sql)
        #[arg(long)]
        file: PathBuf,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Record database path
        #[arg(long)]
        db: Option<PathBuf>,
        /// Wall clock limit in seconds
        #[arg(long)]
        wall_time: Option<f64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,
        /// Output limit in KB
        #[arg(long)]
        output_kb: Option<u64>,
        /// Fall back to rlimit-only isolation when namespaces are unavailable
        #[arg(long)]
        permissive: bool,
    },
    /// Show a user's analysis history, oldest first
    History {
        #[arg(long)]
        user: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List every user's records (administrators only)
    AdminList {
        /// Name recorded in the audit trail (defaults to $USER)
        #[arg(long)]
        operator: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Check that interpreters and kernel features are available
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        eprintln!("Error: scriptbox requires Linux for its sandbox");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Analyze {
            user,
            file,
            config,
            db,
            wall_time,
            memory_mb,
            output_kb,
            permissive,
        } => {
            let mut config = load_config(config.as_deref(), db)?;
            apply_limit_overrides(&mut config, wall_time, memory_mb, output_kb)?;
            if permissive {
                config.isolation = IsolationMode::Permissive;
            }
            analyze(config, &user, &file)
        }
        Commands::History { user, config, db } => {
            let config = load_config(config.as_deref(), db)?;
            let store = open_store(&config)?;
            let records = store.history(&user)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            eprintln!("{} record(s) for {}", records.len(), user);
            Ok(())
        }
        Commands::AdminList {
            operator,
            config,
            db,
        } => {
            let config = load_config(config.as_deref(), db)?;
            let store = open_store(&config)?;
            let operator = operator
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "admin".to_string());
            let records = store.all_records(&AdminCapability::grant(operator))?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            eprintln!("{} record(s) in total", records.len());
            Ok(())
        }
        Commands::CheckDeps { verbose, config } => {
            let config = load_config(config.as_deref(), None)?;
            check_dependencies(&config, verbose)
        }
    }
}

/// Apply the per-run limit flags on top of the loaded configuration
fn apply_limit_overrides(
    config: &mut AnalyzerConfig,
    wall_time: Option<f64>,
    memory_mb: Option<u64>,
    output_kb: Option<u64>,
) -> Result<()> {
    if let Some(seconds) = wall_time {
        anyhow::ensure!(
            seconds.is_finite() && seconds > 0.0,
            "--wall-time must be a positive number of seconds"
        );
        config.max_wall_time_ms = (seconds * 1000.0).round() as u64;
    }
    if let Some(mb) = memory_mb {
        config.max_memory_bytes = mb
            .checked_mul(1024 * 1024)
            .with_context(|| format!("--memory-mb {} is too large", mb))?;
    }
    if let Some(kb) = output_kb {
        config.max_output_bytes = kb
            .checked_mul(1024)
            .with_context(|| format!("--output-kb {} is too large", kb))?;
    }
    Ok(())
}

fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<AnalyzerConfig> {
    let mut config = match path {
        Some(path) => AnalyzerConfig::load(path)?,
        None => AnalyzerConfig::default(),
    };
    if let Some(db) = db {
        config.database_path = db;
    }
    Ok(config)
}

fn open_store(config: &AnalyzerConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path).with_context(|| {
        format!(
            "Failed to open record database {}",
            config.database_path.display()
        )
    })
}

fn analyze(config: AnalyzerConfig, user: &str, file: &Path) -> Result<()> {
    if let Some(audit_log) = &config.audit_log {
        audit::init_security_logger(audit_log.clone())?;
    }

    let upload = intake::accept_file(user, file, config.max_upload_bytes)?;
    let store: Arc<dyn RecordStore> = Arc::new(open_store(&config)?);
    let orchestrator = Orchestrator::from_config(config, store)?;

    match orchestrator.analyze_upload(&upload) {
        Ok(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            eprintln!("{}", record.summary());
            log::debug!(
                "Pipeline counters: {}",
                serde_json::to_string(&get_metrics().snapshot())?
            );
            Ok(())
        }
        Err(e) if e.is_retryable() || matches!(e, ScriptboxError::Cancelled) => {
            eprintln!("Error: {} (retry later)", e);
            std::process::exit(EXIT_TEMPFAIL);
        }
        Err(e) => Err(e.into()),
    }
}

fn check_dependencies(config: &AnalyzerConfig, verbose: bool) -> Result<()> {
    use std::process::Command;

    println!("🔍 Checking scriptbox dependencies...");
    println!();

    let mut all_ok = true;

    match Command::new(&config.python_interpreter).arg("--version").output() {
        Ok(output) if output.status.success() => {
            println!("✅ Python - OK");
            if verbose {
                let version = if output.stdout.is_empty() {
                    String::from_utf8_lossy(&output.stderr).into_owned()
                } else {
                    String::from_utf8_lossy(&output.stdout).into_owned()
                };
                println!(
                    "  {} -> {}",
                    config.python_interpreter.display(),
                    version.lines().next().unwrap_or("").trim()
                );
            }
        }
        _ => {
            all_ok = false;
            println!(
                "❌ Python - missing ({})",
                config.python_interpreter.display()
            );
        }
    }

    let runner = config.sql_runner_path();
    if runner.exists() {
        println!("✅ SQL runner - OK");
        if verbose {
            println!("  {}", runner.display());
        }
    } else {
        all_ok = false;
        println!("❌ SQL runner - missing ({})", runner.display());
    }

    let problems: Vec<String> = check_system_capabilities(config)
        .into_iter()
        .filter(|p| !p.starts_with("python interpreter") && !p.starts_with("sql runner"))
        .collect();
    if problems.is_empty() {
        println!("✅ Namespace isolation - OK");
    } else {
        let severity = if config.isolation == IsolationMode::Strict {
            all_ok = false;
            "❌"
        } else {
            "⚠️ "
        };
        for problem in &problems {
            println!("{} {}", severity, problem);
        }
    }

    println!();
    if all_ok {
        println!("All dependencies are available.");
        Ok(())
    } else {
        println!("Some dependencies are missing; analyses will fail with SandboxUnavailable.");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn analyze_flags_parse() {
        let cli = Cli::try_parse_from([
            "scriptbox",
            "analyze",
            "--user",
            "alice",
            "--file",
            "job.py",
            "--wall-time",
            "2.5",
            "--memory-mb",
            "128",
            "--permissive",
        ])
        .unwrap();
        match cli.command {
            Commands::Analyze {
                user,
                wall_time,
                memory_mb,
                permissive,
                ..
            } => {
                assert_eq!(user, "alice");
                assert_eq!(wall_time, Some(2.5));
                assert_eq!(memory_mb, Some(128));
                assert!(permissive);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn db_flag_overrides_config() {
        let config = load_config(None, Some(PathBuf::from("/tmp/x.db"))).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn oversized_limit_flags_are_rejected() {
        let mut config = AnalyzerConfig::default();
        apply_limit_overrides(&mut config, Some(1.5), Some(64), Some(8)).unwrap();
        assert_eq!(config.max_wall_time_ms, 1500);
        assert_eq!(config.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.max_output_bytes, 8 * 1024);

        let err = apply_limit_overrides(&mut config, None, Some(u64::MAX), None).unwrap_err();
        assert!(err.to_string().contains("--memory-mb"));
        let err = apply_limit_overrides(&mut config, None, None, Some(u64::MAX / 2)).unwrap_err();
        assert!(err.to_string().contains("--output-kb"));
        assert_eq!(config.max_memory_bytes, 64 * 1024 * 1024);
        assert!(apply_limit_overrides(&mut config, Some(f64::NAN), None, None).is_err());
    }
}
