//! The external analytics service.
//!
//! [`AnalyticsSource`] is the seam the crawler talks to; [`HttpAnalyticsSource`]
//! is the production implementation. Responses are classified into explicit
//! outcomes so callers never have to inspect transport errors.

mod classify;
mod http;
mod records;

use async_trait::async_trait;
use thiserror::Error;

use crate::crawler::TaskUnit;
use crate::credentials::CredentialLease;

pub use classify::{ApiEnvelope, SeriesData, classify_envelope, classify_status};
pub use http::{HttpAnalyticsSource, HttpSourceConfig};
pub use records::{SeriesRecord, parse_values, records_from_values};

/// Body of a successful series response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesPayload {
    /// Per-day values in window order.
    Plain(Vec<Option<i64>>),
    /// Cipher text plus the id of the key that decodes it.
    Encrypted { key_id: String, cipher_text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Data(SeriesPayload),
    /// The service answered but has nothing for this unit.
    NoData,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The service considers the credential logged out or blocked.
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),

    /// Anything worth retrying later: throttling, timeouts, 5xx, garbage bodies.
    #[error("transient failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Fetch the series for one task unit using `lease`'s secrets.
    async fn fetch_series(
        &self,
        task: &TaskUnit,
        lease: &CredentialLease,
    ) -> Result<FetchOutcome, FetchError>;

    /// Resolve the decryption key referenced by an encrypted payload.
    async fn fetch_key(&self, key_id: &str, lease: &CredentialLease)
    -> Result<String, FetchError>;
}
