//! Credential database models.

use sqlx::FromRow;

use crate::credentials::{Credential, CredentialState, SecretFields};
use crate::database::time::opt_ms_to_datetime;

/// Row of the `credential` table.
#[derive(Debug, Clone, FromRow)]
pub struct CredentialDbModel {
    pub id: String,
    /// 'available' | 'cooldown' | 'banned'
    pub state: String,
    /// Unix epoch milliseconds (UTC), only set while cooling down.
    pub cooldown_until: Option<i64>,
    pub usage_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_used_at: Option<i64>,
    pub state_changed_at: i64,
    pub created_at: i64,
}

/// Row of the `credential_field` table.
#[derive(Debug, Clone, FromRow)]
pub struct CredentialFieldDbModel {
    pub credential_id: String,
    pub position: i64,
    pub field_name: String,
    pub field_value: String,
}

impl CredentialDbModel {
    /// Assemble the domain credential. `fields` must already be ordered by position.
    pub fn into_credential<'a>(
        self,
        fields: impl IntoIterator<Item = &'a CredentialFieldDbModel>,
    ) -> Credential {
        let secret_fields: SecretFields = fields
            .into_iter()
            .map(|f| (f.field_name.as_str(), f.field_value.as_str()))
            .collect();
        Credential {
            state: CredentialState::from_db(&self.state, self.cooldown_until),
            usage_count: self.usage_count.max(0) as u64,
            success_count: self.success_count.max(0) as u64,
            failure_count: self.failure_count.max(0) as u64,
            last_used_at: opt_ms_to_datetime(self.last_used_at),
            state_changed_at: self.state_changed_at,
            secret_fields,
            id: self.id,
        }
    }
}
