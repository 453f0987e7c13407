//! Failure taxonomy for a single task unit.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::source::FetchError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlError {
    /// No credential became available within the wait budget.
    #[error("Credential pool exhausted: {0}")]
    CredentialExhausted(String),

    /// The service rejected the credential as unauthenticated.
    #[error("Credential {id} rejected: {reason}")]
    CredentialInvalid { id: String, reason: String },

    /// Throttling, timeouts, 5xx or malformed responses.
    #[error("Transient request failure: {0}")]
    TransientRequestFailure(String),

    /// The secondary key request failed.
    #[error("Decryption key unavailable: {0}")]
    DecryptionKeyUnavailable(String),

    /// The payload decrypted or parsed into the wrong shape.
    #[error("Incomplete data: {0}")]
    DataIncomplete(String),

    /// Writing results or progress failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CrawlError {
    /// Whether the credential used for the attempt should be reported as failed.
    pub fn penalizes_credential(&self) -> bool {
        matches!(
            self,
            Self::CredentialInvalid { .. } | Self::TransientRequestFailure(_)
        )
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }

    /// Credential rejections retry at once with another credential instead of
    /// backing off.
    pub fn retries_immediately(&self) -> bool {
        matches!(self, Self::CredentialInvalid { .. })
    }

    pub(crate) fn from_fetch(err: FetchError, credential_id: &str) -> Self {
        match err {
            FetchError::CredentialInvalid(reason) => Self::CredentialInvalid {
                id: credential_id.to_string(),
                reason,
            },
            FetchError::Transient(reason) => Self::TransientRequestFailure(reason),
        }
    }

    pub(crate) fn from_key_fetch(err: FetchError) -> Self {
        Self::DecryptionKeyUnavailable(err.to_string())
    }
}

impl From<CredentialError> for CrawlError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Exhausted { .. } => Self::CredentialExhausted(err.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<subst_cipher::CipherError> for CrawlError {
    fn from(err: subst_cipher::CipherError) -> Self {
        Self::DataIncomplete(format!("decryption failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_predicates() {
        let invalid = CrawlError::CredentialInvalid {
            id: "a".into(),
            reason: "login".into(),
        };
        assert!(invalid.penalizes_credential());
        assert!(invalid.retries_immediately());

        let transient = CrawlError::TransientRequestFailure("429".into());
        assert!(transient.penalizes_credential());
        assert!(transient.is_retryable());

        for err in [
            CrawlError::DecryptionKeyUnavailable("x".into()),
            CrawlError::DataIncomplete("x".into()),
            CrawlError::CredentialExhausted("x".into()),
        ] {
            assert!(!err.penalizes_credential());
            assert!(err.is_retryable());
        }
        assert!(!CrawlError::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn test_exhaustion_maps_to_taxonomy() {
        let err: CrawlError = CredentialError::Exhausted {
            total: 1,
            cooling: 1,
            banned: 0,
        }
        .into();
        assert!(matches!(err, CrawlError::CredentialExhausted(_)));
    }
}
