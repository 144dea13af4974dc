//! Exit status classification
//!
//! Derives the outcome of a run as a pure function over its evidence.

pub mod classifier;

pub use classifier::{OutcomeSignals, VerdictClassifier};
