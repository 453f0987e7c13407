//! Credential error types.

use thiserror::Error;

/// Errors that can occur during credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential is currently selectable.
    #[error("No credential available ({total} total, {cooling} cooling down, {banned} banned)")]
    Exhausted {
        total: usize,
        cooling: usize,
        banned: usize,
    },

    /// A report referenced an id the pool does not know about.
    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared usage cache error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CredentialError {
    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Cache(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl From<crate::Error> for CredentialError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::DatabaseSqlx(e) => CredentialError::Database(e),
            crate::Error::Credential(e) => e,
            other => CredentialError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_is_transient() {
        let err = CredentialError::Exhausted {
            total: 2,
            cooling: 1,
            banned: 1,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("1 banned"));
        assert!(!CredentialError::UnknownCredential("x".into()).is_transient());
    }
}
