//! Progress ledger repository (SQLx).

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::instrument;

use crate::Result;
use crate::database::models::LedgerEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{WritePool, begin_immediate};
use crate::ledger::{LedgerEntry, LedgerStore};

/// SQLite-backed ledger store. One row per `(ledger_name, task_key)`.
pub struct SqlxLedgerStore {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxLedgerStore {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    async fn merge_batch(&self, ledger: &str, entries: &[LedgerEntry]) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        for entry in entries {
            // The update only fires when the incoming row wins the merge.
            sqlx::query(
                r#"
                INSERT INTO task_ledger (ledger_name, task_key, status, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(ledger_name, task_key) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at
                WHERE (excluded.status = 'success' AND task_ledger.status <> 'success')
                   OR (excluded.status = task_ledger.status
                       AND excluded.updated_at > task_ledger.updated_at)
                "#,
            )
            .bind(ledger)
            .bind(&entry.key)
            .bind(entry.status.to_string())
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqlxLedgerStore {
    #[instrument(skip(self))]
    async fn load(&self, ledger: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntryDbModel>(
            "SELECT * FROM task_ledger WHERE ledger_name = ?",
        )
        .bind(ledger)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntryDbModel::into_entry).collect()
    }

    async fn merge(&self, ledger: &str, entries: Vec<LedgerEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("ledger.merge", || self.merge_batch(ledger, &entries)).await
    }
}
