//! Execution control
//!
//! Spawns scripts under isolation, supervises them against their limits and
//! bounds how many run at once.

pub mod cancel;
pub mod cgroup;
pub mod executor;
pub mod memory;
pub mod pool;
pub mod preexec;
pub mod supervisor;

pub use cancel::CancelToken;
pub use executor::{SandboxExecutor, ScriptExecutor};
pub use pool::{SandboxPermit, SandboxPool};
