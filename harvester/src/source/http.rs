//! HTTP implementation of [`AnalyticsSource`].

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, trace};
use url::Url;

use super::classify::{ApiEnvelope, SeriesData, classify_envelope, classify_status};
use super::{AnalyticsSource, FetchError, FetchOutcome};
use crate::crawler::TaskUnit;
use crate::credentials::CredentialLease;
use crate::utils::http_client::build_client;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_series_path")]
    pub series_path: String,

    #[serde(default = "default_key_path")]
    pub key_path: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout enforced by the client.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// API status codes meaning the session is no longer logged in.
    #[serde(default = "default_not_authenticated_codes")]
    pub not_authenticated_codes: Vec<i64>,

    /// API status codes meaning the caller is throttled.
    #[serde(default = "default_rate_limited_codes")]
    pub rate_limited_codes: Vec<i64>,

    #[serde(default)]
    pub proxy_url: Option<String>,
}

fn default_base_url() -> String {
    "https://analytics.example.com".to_string()
}

fn default_series_path() -> String {
    "/api/series".to_string()
}

fn default_key_path() -> String {
    "/api/key".to_string()
}

fn default_user_agent() -> String {
    concat!("harvester/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_not_authenticated_codes() -> Vec<i64> {
    vec![10000]
}

fn default_rate_limited_codes() -> Vec<i64> {
    vec![10001]
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            series_path: default_series_path(),
            key_path: default_key_path(),
            user_agent: default_user_agent(),
            request_timeout_ms: default_request_timeout_ms(),
            not_authenticated_codes: default_not_authenticated_codes(),
            rate_limited_codes: default_rate_limited_codes(),
            proxy_url: None,
        }
    }
}

impl HttpSourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| crate::Error::config(format!("source.base_url: {e}")))?;
        Ok(())
    }
}

pub struct HttpAnalyticsSource {
    client: reqwest::Client,
    series_url: Url,
    key_url: Url,
    config: HttpSourceConfig,
}

impl HttpAnalyticsSource {
    pub fn new(config: HttpSourceConfig) -> crate::Result<Self> {
        let client = build_client(
            &config.user_agent,
            config.request_timeout(),
            config.proxy_url.as_deref(),
        )?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: reqwest::Client, config: HttpSourceConfig) -> crate::Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| crate::Error::config(format!("source.base_url: {e}")))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| crate::Error::config(format!("invalid source path '{path}': {e}")))
        };
        Ok(Self {
            series_url: join(&config.series_path)?,
            key_url: join(&config.key_path)?,
            client,
            config,
        })
    }

    fn cookie_header(lease: &CredentialLease) -> Result<HeaderValue, FetchError> {
        HeaderValue::from_str(&lease.secret_fields.to_cookie_header()).map_err(|_| {
            FetchError::CredentialInvalid(format!(
                "credential {} has fields that are not valid header text",
                lease.id
            ))
        })
    }

    /// Send a GET and decode the JSON envelope, classifying transport failures.
    async fn get_envelope<T: DeserializeOwned>(
        &self,
        url: Url,
        lease: &CredentialLease,
    ) -> Result<ApiEnvelope<T>, FetchError> {
        let response = self
            .client
            .get(url)
            .header(COOKIE, Self::cookie_header(lease)?)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Transient("request timed out".to_string())
                } else {
                    FetchError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            debug!(credential = %lease.id, %status, "Request rejected");
            return Err(err);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body failed: {e}")))?;
        trace!(bytes = body.len(), "Response body received");
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Transient(format!("malformed response body: {e}")))
    }
}

#[async_trait]
impl AnalyticsSource for HttpAnalyticsSource {
    #[instrument(skip(self, lease), fields(task = %task.key(), credential = %lease.id))]
    async fn fetch_series(
        &self,
        task: &TaskUnit,
        lease: &CredentialLease,
    ) -> Result<FetchOutcome, FetchError> {
        let mut url = self.series_url.clone();
        url.query_pairs_mut()
            .append_pair("kind", &task.kind.to_string())
            .append_pair("word", &task.keyword)
            .append_pair("area", &task.area_code)
            .append_pair("startDate", &task.window.start().to_string())
            .append_pair("endDate", &task.window.end().to_string());

        let envelope: ApiEnvelope<SeriesData> = self.get_envelope(url, lease).await?;
        classify_envelope(
            envelope,
            &self.config.not_authenticated_codes,
            &self.config.rate_limited_codes,
        )
    }

    #[instrument(skip(self, lease), fields(credential = %lease.id))]
    async fn fetch_key(&self, key_id: &str, lease: &CredentialLease) -> Result<String, FetchError> {
        let mut url = self.key_url.clone();
        url.query_pairs_mut().append_pair("id", key_id);

        let envelope: ApiEnvelope<String> = self.get_envelope(url, lease).await?;
        if envelope.status != 0 {
            let detail = format!("API status {}: {}", envelope.status, envelope.message);
            return Err(
                if self.config.not_authenticated_codes.contains(&envelope.status) {
                    FetchError::CredentialInvalid(detail)
                } else {
                    FetchError::Transient(detail)
                },
            );
        }

        match envelope.data {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(FetchError::Transient(format!("empty key for id {key_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SecretFields;

    #[test]
    fn test_urls_are_joined() {
        crate::utils::http_client::install_rustls_provider();
        let config = HttpSourceConfig {
            base_url: "https://stats.example.org/".into(),
            ..Default::default()
        };
        let source = HttpAnalyticsSource::with_client(reqwest::Client::new(), config).unwrap();
        assert_eq!(source.series_url.as_str(), "https://stats.example.org/api/series");
        assert_eq!(source.key_url.as_str(), "https://stats.example.org/api/key");
    }

    #[test]
    fn test_invalid_base_url() {
        crate::utils::http_client::install_rustls_provider();
        let config = HttpSourceConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(HttpAnalyticsSource::with_client(reqwest::Client::new(), config).is_err());
    }

    #[test]
    fn test_cookie_header_rejects_control_chars() {
        let lease = CredentialLease {
            id: "a".into(),
            secret_fields: [("SID", "ok\nbad")].into_iter().collect::<SecretFields>(),
        };
        assert!(matches!(
            HttpAnalyticsSource::cookie_header(&lease),
            Err(FetchError::CredentialInvalid(_))
        ));

        let lease = CredentialLease {
            id: "a".into(),
            secret_fields: [("SID", "x"), ("T", "y")].into_iter().collect::<SecretFields>(),
        };
        assert_eq!(
            HttpAnalyticsSource::cookie_header(&lease).unwrap(),
            "SID=x; T=y"
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        crate::utils::http_client::install_rustls_provider();
        let config = HttpSourceConfig {
            base_url: "http://127.0.0.1:9".into(),
            request_timeout_ms: 2_000,
            ..Default::default()
        };
        let source = HttpAnalyticsSource::new(config).unwrap();
        let lease = CredentialLease {
            id: "a".into(),
            secret_fields: SecretFields::new(),
        };
        let err = source.fetch_key("k", &lease).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }
}
