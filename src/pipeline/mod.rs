//! Analysis pipeline
//!
//! Ties intake, static analysis, sandboxed execution, metrics derivation and
//! storage into one call per upload.

pub mod clock;
pub mod orchestrator;

pub use clock::RecordClock;
pub use orchestrator::{Orchestrator, RUNTIME_PENALTY};
