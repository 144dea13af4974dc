//! Append-only persistence for analysis records.
//!
//! Records are never updated or deleted once stored. Per-user history comes
//! back in creation order; listing every user's records needs an
//! [`AdminCapability`].

pub mod memory;
pub mod sqlite;

use crate::config::types::{AnalysisRecord, Result};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Proof that the caller was authorised to see every user's records
#[derive(Debug, Clone)]
pub struct AdminCapability {
    operator: String,
}

impl AdminCapability {
    /// Issued by the surface that authenticated `operator` as an administrator
    pub fn grant(operator: impl Into<String>) -> Self {
        let operator = operator.into();
        log::info!(target: "scriptbox::audit", "Admin capability granted to {}", operator);
        Self { operator }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }
}

pub trait RecordStore: Send + Sync {
    fn append(&self, record: &AnalysisRecord) -> Result<()>;

    /// All records for `user_id`, oldest first
    fn history(&self, user_id: &str) -> Result<Vec<AnalysisRecord>>;

    /// Most recent record for one of the user's files
    fn latest_for_file(&self, user_id: &str, filename: &str) -> Result<Option<AnalysisRecord>>;

    /// Every record across users, oldest first
    fn all_records(&self, admin: &AdminCapability) -> Result<Vec<AnalysisRecord>>;
}
