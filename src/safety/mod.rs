//! Safety and cleanup
//!
//! Run-scoped workspaces and the symlink-safe removal behind them.

pub mod safe_cleanup;
pub mod workspace;
