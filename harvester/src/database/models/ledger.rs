//! Progress ledger database model.

use sqlx::FromRow;
use std::str::FromStr;

use crate::ledger::{LedgerEntry, LedgerStatus};

/// Row of the `task_ledger` table.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntryDbModel {
    pub ledger_name: String,
    pub task_key: String,
    /// 'success' | 'failed'
    pub status: String,
    /// Unix epoch milliseconds (UTC).
    pub updated_at: i64,
}

impl LedgerEntryDbModel {
    pub fn into_entry(self) -> crate::Result<LedgerEntry> {
        let status = LedgerStatus::from_str(&self.status).map_err(|_| {
            crate::Error::Database(format!(
                "invalid ledger status '{}' for key {}",
                self.status, self.task_key
            ))
        })?;
        Ok(LedgerEntry {
            key: self.task_key,
            status,
            updated_at: self.updated_at,
        })
    }
}
