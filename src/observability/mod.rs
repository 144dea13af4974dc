//! Observability
//!
//! Structured audit events and pipeline counters.

pub mod audit;
pub mod metrics;
