//! scriptbox: sandboxed execution and static risk scoring for uploaded scripts
//!
//! Each Python or SQL upload is analysed twice, in parallel: statically for
//! risky constructs, and by running it in a resource-limited sandbox. The
//! results become one immutable [`AnalysisRecord`] in an append-only store.
//!
//! # Architecture
//!
//! ## Intake ([`intake`])
//! - Filename sanitising, extension and size checks
//!
//! ## Static Analysis ([`analyzer`])
//! - [`analyzer::python`]: Python rule set over a comment/string-masked source
//! - [`analyzer::sql`]: SQL rule set with statement splitting
//! - [`analyzer::score`]: Weighted score and risk level
//!
//! ## Execution Control ([`exec`], [`runtime`], [`verdict`])
//! - [`exec::executor`]: Workspace, spawn, isolation fallback, telemetry
//! - [`exec::preexec`]: Child-side rlimits and namespace setup
//! - [`exec::supervisor`]: wait4 polling, limit enforcement, group kill
//! - [`exec::pool`]: Bounded sandbox concurrency
//! - [`runtime`]: Per-language launch adapters
//! - [`verdict`]: Exit status classification over run evidence
//!
//! ## Metrics & Records ([`performance`], [`store`], [`pipeline`])
//! - [`performance::derive`]: Performance metrics from telemetry
//! - [`store`]: Append-only record stores (SQLite, in-memory)
//! - [`pipeline`]: Orchestration, retry, monotonic record clock
//!
//! ## Safety & Observability ([`safety`], [`observability`], [`utils`])
//! - [`safety::workspace`]: Run-scoped directories removed on every path
//! - [`safety::safe_cleanup`]: Symlink-safe tree removal
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Pipeline counters
//! - [`utils::output`]: Bounded output collection

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod exec;
pub mod intake;
pub mod observability;
pub mod performance;
pub mod pipeline;
pub mod runtime;
pub mod safety;
pub mod store;
pub mod utils;
pub mod verdict;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use exec::{CancelToken, SandboxExecutor, ScriptExecutor};
pub use pipeline::Orchestrator;
