//! Response classification.

use reqwest::StatusCode;
use serde::Deserialize;

use super::{FetchError, FetchOutcome, SeriesPayload};

/// Common JSON wrapper of every API response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    /// `0` on success, an API error code otherwise.
    pub status: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

/// `data` of a series response. Either `values` (plain) or `series` plus
/// `key_id` (encrypted) is present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesData {
    #[serde(default)]
    pub values: Option<Vec<Option<i64>>>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

/// Classify the HTTP status line. `None` means read the body.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Some(FetchError::CredentialInvalid(format!("HTTP {status}")))
        }
        s if s.is_success() => None,
        s => Some(FetchError::Transient(format!("HTTP {s}"))),
    }
}

/// Classify a decoded envelope.
///
/// `not_authenticated` and `rate_limited` are the API codes that mean "log in
/// again" and "slow down"; any other non-zero code is treated as transient.
pub fn classify_envelope(
    envelope: ApiEnvelope<SeriesData>,
    not_authenticated: &[i64],
    rate_limited: &[i64],
) -> Result<FetchOutcome, FetchError> {
    if envelope.status != 0 {
        let detail = format!("API status {}: {}", envelope.status, envelope.message);
        return Err(if not_authenticated.contains(&envelope.status) {
            FetchError::CredentialInvalid(detail)
        } else if rate_limited.contains(&envelope.status) {
            FetchError::Transient(format!("rate limited ({detail})"))
        } else {
            FetchError::Transient(detail)
        });
    }

    let Some(data) = envelope.data else {
        return Ok(FetchOutcome::NoData);
    };

    if let Some(values) = data.values {
        return Ok(if values.is_empty() {
            FetchOutcome::NoData
        } else {
            FetchOutcome::Data(SeriesPayload::Plain(values))
        });
    }

    match (data.series, data.key_id) {
        (Some(series), _) if series.is_empty() => Ok(FetchOutcome::NoData),
        (Some(cipher_text), Some(key_id)) if !key_id.is_empty() => {
            Ok(FetchOutcome::Data(SeriesPayload::Encrypted {
                key_id,
                cipher_text,
            }))
        }
        (Some(_), _) => Err(FetchError::Transient(
            "encrypted series without key id".to_string(),
        )),
        (None, _) => Ok(FetchOutcome::NoData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ApiEnvelope<SeriesData> {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(FetchError::CredentialInvalid(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(FetchError::Transient(_))
        ));
        assert!(classify_status(StatusCode::OK).is_none());
    }

    #[test]
    fn test_api_codes() {
        let not_auth = parse(r#"{"status": 10000, "message": "not login"}"#);
        assert!(matches!(
            classify_envelope(not_auth, &[10000], &[10001]),
            Err(FetchError::CredentialInvalid(_))
        ));

        let limited = parse(r#"{"status": 10001, "message": "busy"}"#);
        assert!(matches!(
            classify_envelope(limited, &[10000], &[10001]),
            Err(FetchError::Transient(msg)) if msg.contains("rate limited")
        ));
    }

    #[test]
    fn test_payload_shapes() {
        let plain = parse(r#"{"status": 0, "data": {"values": [1, null, 3]}}"#);
        assert_eq!(
            classify_envelope(plain, &[], &[]).unwrap(),
            FetchOutcome::Data(SeriesPayload::Plain(vec![Some(1), None, Some(3)]))
        );

        let encrypted = parse(r#"{"status": 0, "data": {"series": "ab", "key_id": "u1"}}"#);
        assert_eq!(
            classify_envelope(encrypted, &[], &[]).unwrap(),
            FetchOutcome::Data(SeriesPayload::Encrypted {
                key_id: "u1".into(),
                cipher_text: "ab".into()
            })
        );

        let empty = parse(r#"{"status": 0, "data": {"series": "", "key_id": "u1"}}"#);
        assert_eq!(classify_envelope(empty, &[], &[]).unwrap(), FetchOutcome::NoData);
        let missing = parse(r#"{"status": 0}"#);
        assert_eq!(classify_envelope(missing, &[], &[]).unwrap(), FetchOutcome::NoData);

        let no_key = parse(r#"{"status": 0, "data": {"series": "ab"}}"#);
        assert!(matches!(
            classify_envelope(no_key, &[], &[]),
            Err(FetchError::Transient(_))
        ));
    }
}
