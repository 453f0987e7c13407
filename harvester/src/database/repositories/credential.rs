//! Credential store repository (SQLx).
//!
//! Database-backed persistence for the credential pool.

use async_trait::async_trait;
use itertools::Itertools;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::credentials::{
    CounterDelta, Credential, CredentialError, CredentialState, CredentialStore, last_used_ms,
};
use crate::database::models::{CredentialDbModel, CredentialFieldDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{WritePool, begin_immediate};

/// SQLx-backed credential store.
pub struct SqlxCredentialStore {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxCredentialStore {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    async fn write_counters(&self, deltas: &[CounterDelta]) -> crate::Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        for delta in deltas {
            // MAX() is NULL if either side is; COALESCE falls back to whichever is set.
            sqlx::query(
                r#"
                UPDATE credential
                SET usage_count = usage_count + ?,
                    success_count = success_count + ?,
                    failure_count = failure_count + ?,
                    last_used_at = COALESCE(MAX(last_used_at, ?), last_used_at, ?)
                WHERE id = ?
                "#,
            )
            .bind(delta.usage as i64)
            .bind(delta.success as i64)
            .bind(delta.failure as i64)
            .bind(last_used_ms(delta))
            .bind(last_used_ms(delta))
            .bind(&delta.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_credential(&self, credential: &Credential) -> crate::Result<()> {
        let now = now_ms();
        let (state, cooldown_until) = credential.state.to_db();

        let mut tx = begin_immediate(&self.write_pool).await?;
        sqlx::query(
            r#"
            INSERT INTO credential (
                id, state, cooldown_until, usage_count, success_count, failure_count,
                last_used_at, state_changed_at, created_at
            ) VALUES (?, ?, ?, 0, 0, 0, NULL, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&credential.id)
        .bind(state)
        .bind(cooldown_until)
        .bind(credential.state_changed_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM credential_field WHERE credential_id = ?")
            .bind(&credential.id)
            .execute(&mut *tx)
            .await?;

        for (position, (name, value)) in credential.secret_fields.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO credential_field (credential_id, position, field_name, field_value)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&credential.id)
            .bind(position as i64)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqlxCredentialStore {
    #[instrument(skip(self))]
    async fn load_all(&self) -> Result<Vec<Credential>, CredentialError> {
        let rows = sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credential ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let fields = sqlx::query_as::<_, CredentialFieldDbModel>(
            "SELECT * FROM credential_field ORDER BY credential_id, position",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_credential = fields.into_iter().into_group_map_by(|f| f.credential_id.clone());

        let credentials: Vec<Credential> = rows
            .into_iter()
            .map(|row| {
                let fields = by_credential.get(&row.id).cloned().unwrap_or_default();
                row.into_credential(&fields)
            })
            .collect();

        debug!(count = credentials.len(), "Loaded credentials from database");
        Ok(credentials)
    }

    async fn save_state(
        &self,
        id: &str,
        state: CredentialState,
        changed_at: i64,
    ) -> Result<bool, CredentialError> {
        let (label, cooldown_until) = state.to_db();
        let result = retry_on_sqlite_busy("credential.save_state", || async {
            Ok(sqlx::query(
                r#"
                UPDATE credential
                SET state = ?, cooldown_until = ?, state_changed_at = ?
                WHERE id = ? AND state <> 'banned'
                "#,
            )
            .bind(label)
            .bind(cooldown_until)
            .bind(changed_at)
            .bind(id)
            .execute(&self.write_pool)
            .await?)
        })
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Nothing updated: either unknown or already banned.
        let stored: Option<String> = sqlx::query_scalar("SELECT state FROM credential WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match stored {
            Some(_) => {
                debug!(credential = %id, "Stored credential is banned, state write skipped");
                Ok(false)
            }
            None => Err(CredentialError::UnknownCredential(id.to_string())),
        }
    }

    async fn save_counters(&self, deltas: &[CounterDelta]) -> Result<(), CredentialError> {
        if deltas.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("credential.save_counters", || self.write_counters(deltas)).await?;
        Ok(())
    }

    #[instrument(skip(self, credential), fields(credential = %credential.id))]
    async fn upsert_credential(&self, credential: &Credential) -> Result<(), CredentialError> {
        retry_on_sqlite_busy("credential.upsert", || self.write_credential(credential)).await?;
        debug!("Credential upserted");
        Ok(())
    }

    async fn unban(&self, id: &str) -> Result<(), CredentialError> {
        let changed_at = now_ms();
        let result = retry_on_sqlite_busy("credential.unban", || async {
            Ok(sqlx::query(
                r#"
                UPDATE credential
                SET state = 'available', cooldown_until = NULL, state_changed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(changed_at)
            .bind(id)
            .execute(&self.write_pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(CredentialError::UnknownCredential(id.to_string()));
        }
        debug!(credential = %id, "Credential unbanned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialPool, CredentialPoolConfig, SecretFields};
    use std::sync::Arc;

    async fn setup() -> (tempfile::TempDir, SqlxCredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("cred.db").display());
        let (pool, write_pool) = crate::database::open(&url).await.unwrap();
        (dir, SqlxCredentialStore::new(pool, write_pool))
    }

    #[tokio::test]
    async fn test_upsert_and_load_round_trip() {
        let (_dir, store) = setup().await;
        let fields: SecretFields = [("BDUSS", "x"), ("SID", "y")].into_iter().collect();
        store
            .upsert_credential(&Credential::new("acct-1", fields.clone()))
            .await
            .unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "acct-1");
        assert_eq!(all[0].secret_fields, fields);
        assert_eq!(all[0].state, CredentialState::Available);

        // Re-provisioning replaces fields and leaves state alone.
        store
            .save_state("acct-1", CredentialState::PermanentlyBanned, now_ms())
            .await
            .unwrap();
        let replaced: SecretFields = [("BDUSS", "z")].into_iter().collect();
        store
            .upsert_credential(&Credential::new("acct-1", replaced.clone()))
            .await
            .unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all[0].secret_fields, replaced);
        assert_eq!(all[0].state, CredentialState::PermanentlyBanned);
    }

    #[tokio::test]
    async fn test_state_counters_and_unban() {
        let (_dir, store) = setup().await;
        store
            .upsert_credential(&Credential::new("a", SecretFields::new()))
            .await
            .unwrap();

        store
            .save_state("a", CredentialState::PermanentlyBanned, 42)
            .await
            .unwrap();
        let delta = CounterDelta {
            usage: 7,
            success: 6,
            failure: 1,
            ..CounterDelta::new("a")
        };
        store.save_counters(&[delta]).await.unwrap();

        store.unban("a").await.unwrap();
        let loaded = &store.load_all().await.unwrap()[0];
        assert_eq!(loaded.state, CredentialState::Available);
        assert!(loaded.state_changed_at > 42);
        assert_eq!(loaded.usage_count, 7);
        assert_eq!(loaded.failure_count, 1);

        assert!(matches!(
            store.unban("missing").await,
            Err(CredentialError::UnknownCredential(_))
        ));
    }

    /// Two pools sharing one database, as two harvester processes would.
    async fn two_pools(
        store: SqlxCredentialStore,
    ) -> (Arc<SqlxCredentialStore>, CredentialPool, CredentialPool) {
        store
            .upsert_credential(&Credential::new("a", SecretFields::new()))
            .await
            .unwrap();
        let store = Arc::new(store);
        let config = CredentialPoolConfig {
            cooldown_secs: 1,
            ..Default::default()
        };
        let p1 = CredentialPool::load(store.clone(), None, config.clone()).await.unwrap();
        let p2 = CredentialPool::load(store.clone(), None, config).await.unwrap();
        (store, p1, p2)
    }

    #[tokio::test]
    async fn test_late_cooldown_does_not_lift_ban_from_other_process() {
        let (_dir, store) = setup().await;
        let (store, p1, p2) = two_pools(store).await;

        p1.report("a", false, true).await.unwrap();
        // p2 still believes "a" is usable and reports a transient failure.
        p2.report("a", false, false).await.unwrap();

        let stored = &store.load_all().await.unwrap()[0];
        assert_eq!(stored.state, CredentialState::PermanentlyBanned);
        assert_eq!(p2.snapshot()[0].state, CredentialState::PermanentlyBanned);

        // Even once the cooldown would have run out, nobody gets it back.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(p2.acquire().is_err());
        let restarted = CredentialPool::load(store, None, CredentialPoolConfig::default())
            .await
            .unwrap();
        assert!(restarted.acquire().is_err());
    }

    #[tokio::test]
    async fn test_resync_from_two_pools_sums_usage() {
        let (_dir, store) = setup().await;
        let (store, p1, p2) = two_pools(store).await;

        for _ in 0..3 {
            p1.acquire().unwrap();
            p1.report("a", true, false).await.unwrap();
        }
        for _ in 0..2 {
            p2.acquire().unwrap();
            p2.report("a", true, false).await.unwrap();
        }
        p1.resync().await.unwrap();
        p2.resync().await.unwrap();
        // A second pass with nothing new must not add anything.
        p1.resync().await.unwrap();

        let stored = &store.load_all().await.unwrap()[0];
        assert_eq!(stored.usage_count, 5);
        assert_eq!(stored.success_count, 5);
        assert!(stored.last_used_at.is_some());
        assert_eq!(p1.snapshot()[0].usage_count, 5);
    }
}
