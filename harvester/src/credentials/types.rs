//! Core credential types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms};

/// Ordered secret name/value pairs of a credential (cookie fields).
///
/// Insertion order is kept because some services are picky about cookie order.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFields(Vec<(String, String)>);

impl SecretFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, replacing the value in place if the name already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a `Cookie` header value: `name=value; name2=value2`.
    pub fn to_cookie_header(&self) -> String {
        self.iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = SecretFields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

// Values never end up in logs.
impl fmt::Debug for SecretFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|(n, _)| format!("{n}=***")))
            .finish()
    }
}

/// Availability state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    Cooldown { until: DateTime<Utc> },
    PermanentlyBanned,
}

impl CredentialState {
    /// Whether the credential can be handed out at `now`.
    #[inline]
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Available => true,
            Self::Cooldown { until } => now >= *until,
            Self::PermanentlyBanned => false,
        }
    }

    /// Expired cooldowns collapse to `Available`.
    pub fn normalized(self, now: DateTime<Utc>) -> Self {
        match self {
            Self::Cooldown { until } if now >= until => Self::Available,
            other => other,
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, Self::PermanentlyBanned)
    }

    /// Column values for `credential.state` / `credential.cooldown_until`.
    pub fn to_db(&self) -> (&'static str, Option<i64>) {
        match self {
            Self::Available => ("available", None),
            Self::Cooldown { until } => ("cooldown", Some(datetime_to_ms(*until))),
            Self::PermanentlyBanned => ("banned", None),
        }
    }

    /// Inverse of [`to_db`](Self::to_db). Unknown labels and cooldowns without an
    /// expiry are treated as available.
    pub fn from_db(state: &str, cooldown_until: Option<i64>) -> Self {
        match (state, cooldown_until) {
            ("banned", _) => Self::PermanentlyBanned,
            ("cooldown", Some(ms)) => Self::Cooldown {
                until: ms_to_datetime(ms),
            },
            _ => Self::Available,
        }
    }
}

/// A credential as held by the pool.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret_fields: SecretFields,
    pub state: CredentialState,
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Epoch ms of the last state transition, used to reconcile with the store.
    pub state_changed_at: i64,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret_fields: SecretFields) -> Self {
        Self {
            id: id.into(),
            secret_fields,
            state: CredentialState::Available,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            last_used_at: None,
            state_changed_at: now_ms(),
        }
    }

    pub fn with_state(mut self, state: CredentialState) -> Self {
        self.state = state;
        self
    }

    pub(crate) fn set_state(&mut self, state: CredentialState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = now_ms();
        }
    }

    pub fn lease(&self) -> CredentialLease {
        CredentialLease {
            id: self.id.clone(),
            secret_fields: self.secret_fields.clone(),
        }
    }

    pub fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot {
            id: self.id.clone(),
            state: self.state,
            usage_count: self.usage_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_used_at: self.last_used_at,
        }
    }
}

/// What a worker gets from `acquire`: the id to report against and the secrets
/// to send. There is no exclusive checkout.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub id: String,
    pub secret_fields: SecretFields,
}

/// Read-only view of a credential for logs and status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub state: CredentialState,
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Counter increments a pool has made since its last write to the store.
///
/// Stores add these to what they hold, so several processes sharing one store
/// sum their usage instead of overwriting each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub id: String,
    pub usage: u64,
    pub success: u64,
    pub failure: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CounterDelta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.usage == 0 && self.success == 0 && self.failure == 0 && self.last_used_at.is_none()
    }

    /// Fold `other` into `self`.
    pub fn absorb(&mut self, other: &CounterDelta) {
        self.usage += other.usage;
        self.success += other.success;
        self.failure += other.failure;
        self.last_used_at = self.last_used_at.max(other.last_used_at);
    }
}

/// Pool-level events, broadcast to any subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// Selectable credentials fell below the configured minimum.
    Degraded { available: usize, minimum: usize },
    /// Selectable credentials are back at or above the minimum.
    Recovered { available: usize },
    /// A credential was permanently banned.
    Banned { id: String },
}

/// Credential pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPoolConfig {
    /// How long a transiently failing credential sits out.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Below this many selectable credentials the pool reports itself degraded.
    #[serde(default = "default_min_available")]
    pub min_available: usize,

    /// Interval for reconciling with the durable store.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_cooldown_secs() -> u64 {
    30 * 60
}

fn default_min_available() -> usize {
    1
}

fn default_resync_interval_secs() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    64
}

impl Default for CredentialPoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_available: default_min_available(),
            resync_interval_secs: default_resync_interval_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl CredentialPoolConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}
