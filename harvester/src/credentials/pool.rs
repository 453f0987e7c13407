//! Credential pool.
//!
//! Hands out credentials for requests and tracks their health. Selection is
//! least-used first, a transient failure parks a credential in cooldown, and a
//! permanent failure bans it for good. State changes are written through to the
//! durable store; usage counters are shared through the cache and added to the
//! store on resync.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::cache::{CachedUsage, CredentialCache};
use super::error::CredentialError;
use super::store::CredentialStore;
use super::types::{
    CounterDelta, Credential, CredentialLease, CredentialPoolConfig, CredentialSnapshot,
    CredentialState, PoolEvent,
};

/// Outcome of a [`CredentialPool::resync`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub added: usize,
    pub removed: usize,
    /// Credentials whose state was taken over from the store.
    pub adopted: usize,
}

pub struct CredentialPool {
    config: CredentialPoolConfig,
    credentials: Mutex<HashMap<String, Credential>>,
    /// Increments not yet added to the store. Locked after `credentials`.
    unsynced: Mutex<HashMap<String, CounterDelta>>,
    store: Arc<dyn CredentialStore>,
    cache: Option<Arc<dyn CredentialCache>>,
    events: broadcast::Sender<PoolEvent>,
    released: Notify,
    degraded: AtomicBool,
}

impl CredentialPool {
    /// Build a pool from already loaded credentials.
    pub fn new(
        credentials: Vec<Credential>,
        store: Arc<dyn CredentialStore>,
        cache: Option<Arc<dyn CredentialCache>>,
        config: CredentialPoolConfig,
    ) -> Self {
        let now = Utc::now();
        let credentials = credentials
            .into_iter()
            .map(|mut c| {
                c.state = c.state.normalized(now);
                (c.id.clone(), c)
            })
            .collect();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let pool = Self {
            config,
            credentials: Mutex::new(credentials),
            unsynced: Mutex::new(HashMap::new()),
            store,
            cache,
            events,
            released: Notify::new(),
            degraded: AtomicBool::new(false),
        };
        pool.check_capacity(pool.available_count());
        pool
    }

    /// Load every credential from the store.
    pub async fn load(
        store: Arc<dyn CredentialStore>,
        cache: Option<Arc<dyn CredentialCache>>,
        config: CredentialPoolConfig,
    ) -> Result<Self, CredentialError> {
        let credentials = store.load_all().await?;
        info!(count = credentials.len(), "Loaded credentials");
        Ok(Self::new(credentials, store, cache, config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CredentialPoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.credentials.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.lock().is_empty()
    }

    /// Pick the least used selectable credential.
    ///
    /// Ties go to the credential idle the longest (never used first), then to
    /// the smallest id. Never blocks.
    pub fn acquire(&self) -> Result<CredentialLease, CredentialError> {
        let now = Utc::now();
        let (result, available) = {
            let mut map = self.credentials.lock();
            let picked = map
                .values()
                .filter(|c| c.state.is_selectable(now))
                .min_by(|a, b| {
                    a.usage_count
                        .cmp(&b.usage_count)
                        .then(a.last_used_at.cmp(&b.last_used_at))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|c| c.id.clone());

            let result = match picked.and_then(|id| map.get_mut(&id)) {
                Some(cred) => {
                    cred.state = cred.state.normalized(now);
                    cred.last_used_at = Some(now);
                    self.unsynced_entry(&cred.id, |d| d.last_used_at = Some(now));
                    Ok(cred.lease())
                }
                None => Err(exhausted(map.values(), now)),
            };
            (result, count_selectable(map.values(), now))
        };

        self.check_capacity(available);
        result
    }

    /// Like [`acquire`](Self::acquire), but waits up to `max_wait` for a
    /// credential to become selectable.
    pub async fn acquire_within(
        &self,
        max_wait: Duration,
    ) -> Result<CredentialLease, CredentialError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Created before the attempt so a release in between is not missed.
            let released = self.released.notified();

            let err = match self.acquire() {
                Ok(lease) => return Ok(lease),
                Err(err) if err.is_exhausted() => err,
                Err(err) => return Err(err),
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(err);
            }

            let wake_at = match self.next_cooldown_expiry() {
                Some(until) => {
                    let until_in = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    (now + until_in).min(deadline)
                }
                None => deadline,
            };

            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Record the outcome of a request made with credential `id`.
    ///
    /// - success: counts a use; an expired cooldown becomes `Available`.
    /// - transient failure: cooldown for the configured period. Ignored for
    ///   banned credentials.
    /// - permanent failure: banned, whatever the current state.
    ///
    /// If the store already holds a ban (another process banned it), the ban
    /// is adopted locally instead of being overwritten.
    pub async fn report(
        &self,
        id: &str,
        success: bool,
        permanent: bool,
    ) -> Result<(), CredentialError> {
        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(self.config.cooldown())
            .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let (state_change, mut snapshot, mut newly_banned, mut available) = {
            let mut map = self.credentials.lock();
            let cred = map
                .get_mut(id)
                .ok_or_else(|| CredentialError::UnknownCredential(id.to_string()))?;
            let before = cred.state;
            let before_changed_at = cred.state_changed_at;
            let before_failures = cred.failure_count;

            if success {
                cred.usage_count += 1;
                cred.success_count += 1;
                if !before.is_banned() {
                    cred.set_state(before.normalized(now));
                }
            } else if permanent {
                if !before.is_banned() {
                    cred.failure_count += 1;
                }
                cred.set_state(CredentialState::PermanentlyBanned);
            } else if !before.is_banned() {
                cred.failure_count += 1;
                cred.set_state(CredentialState::Cooldown {
                    until: now + cooldown,
                });
            }

            let failed = cred.failure_count - before_failures;
            self.unsynced_entry(id, |d| {
                if success {
                    d.usage += 1;
                    d.success += 1;
                }
                d.failure += failed;
            });

            let state_change = (cred.state_changed_at != before_changed_at)
                .then_some((cred.state, cred.state_changed_at));
            let newly_banned = cred.state.is_banned() && !before.is_banned();
            let snapshot = cred.snapshot();
            (
                state_change,
                snapshot,
                newly_banned,
                count_selectable(map.values(), now),
            )
        };

        if let Some((state, changed_at)) = state_change {
            debug!(credential = %id, ?state, "Credential state changed");
            match self.store.save_state(id, state, changed_at).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Some((banned, now_available)) = self.adopt_stored_ban(id) {
                        snapshot = banned;
                        newly_banned = true;
                        available = now_available;
                    }
                }
                Err(e) => {
                    warn!(credential = %id, error = %e, "Failed to persist credential state");
                }
            }
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.record_use(id, success).await {
                debug!(credential = %id, error = %e, "Cache record_use failed");
            }
            if state_change.is_some()
                && let Err(e) = cache.put_state(&snapshot).await
            {
                debug!(credential = %id, error = %e, "Cache put_state failed");
            }
        }

        if newly_banned {
            warn!(credential = %id, "Credential permanently banned");
            let _ = self.events.send(PoolEvent::Banned { id: id.to_string() });
        }

        self.check_capacity(available);
        if success {
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Reconcile with the durable store and the shared cache.
    ///
    /// Local counter increments are added to the store first. Then new
    /// credentials are added, removed ones dropped, and a stored ban or a store
    /// state with a newer `state_changed_at` (administrative unban) replaces the
    /// local one. Counters become the stored totals plus anything counted since,
    /// raised to the cached values where those are higher.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> Result<ResyncReport, CredentialError> {
        self.push_counters().await;
        let stored = self.store.load_all().await?;
        let ids: Vec<String> = stored.iter().map(|c| c.id.clone()).collect();

        let cached = match &self.cache {
            Some(cache) => cache.usage(&ids).await.unwrap_or_else(|e| {
                debug!(error = %e, "Cache usage lookup failed");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let now = Utc::now();
        let mut report = ResyncReport::default();
        let available = {
            let mut map = self.credentials.lock();
            let unsynced = self.unsynced.lock();
            let mut next = HashMap::with_capacity(stored.len());

            for incoming in stored {
                let merged = match map.remove(&incoming.id) {
                    Some(mut local) => {
                        let stored_ban = incoming.state.is_banned() && !local.state.is_banned();
                        if stored_ban || incoming.state_changed_at > local.state_changed_at {
                            debug!(
                                credential = %local.id,
                                from = ?local.state,
                                to = ?incoming.state,
                                "Adopting stored credential state"
                            );
                            local.state = incoming.state;
                            local.state_changed_at = incoming.state_changed_at;
                            report.adopted += 1;
                        }
                        let pending = unsynced.get(&local.id).cloned().unwrap_or_default();
                        local.secret_fields = incoming.secret_fields;
                        local.usage_count = incoming.usage_count + pending.usage;
                        local.success_count = incoming.success_count + pending.success;
                        local.failure_count = incoming.failure_count + pending.failure;
                        local.last_used_at = local.last_used_at.max(incoming.last_used_at);
                        local
                    }
                    None => {
                        info!(credential = %incoming.id, "New credential provisioned");
                        report.added += 1;
                        incoming
                    }
                };
                next.insert(merged.id.clone(), merged);
            }

            for id in map.keys() {
                info!(credential = %id, "Credential removed from store");
            }
            report.removed = map.len();

            for cred in next.values_mut() {
                cred.state = cred.state.normalized(now);
                if let Some(usage) = cached.get(&cred.id) {
                    merge_cached(cred, usage);
                }
            }

            *map = next;
            count_selectable(map.values(), now)
        };

        self.check_capacity(available);
        self.released.notify_waiters();
        debug!(?report, available, "Credential resync complete");
        Ok(report)
    }

    /// Run [`resync`](Self::resync) every `resync_interval` until cancelled.
    pub fn spawn_resync(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.resync_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the pool was just loaded.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.resync().await {
                            warn!(error = %e, "Credential resync failed");
                        }
                    }
                }
            }
            debug!("Credential resync task stopped");
        })
    }

    /// Number of credentials selectable right now.
    pub fn available_count(&self) -> usize {
        count_selectable(self.credentials.lock().values(), Utc::now())
    }

    pub fn is_degraded(&self) -> bool {
        self.available_count() < self.config.min_available
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let mut out: Vec<CredentialSnapshot> = self
            .credentials
            .lock()
            .values()
            .map(|c| c.snapshot())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Add pending increments to the store. On failure they stay pending.
    async fn push_counters(&self) {
        let deltas: Vec<CounterDelta> = std::mem::take(&mut *self.unsynced.lock())
            .into_values()
            .filter(|d| !d.is_empty())
            .collect();
        if deltas.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_counters(&deltas).await {
            warn!(error = %e, "Failed to persist credential counters");
            let mut unsynced = self.unsynced.lock();
            for delta in &deltas {
                unsynced
                    .entry(delta.id.clone())
                    .or_insert_with(|| CounterDelta::new(&delta.id))
                    .absorb(delta);
            }
        }
    }

    fn unsynced_entry(&self, id: &str, update: impl FnOnce(&mut CounterDelta)) {
        let mut unsynced = self.unsynced.lock();
        update(
            unsynced
                .entry(id.to_string())
                .or_insert_with(|| CounterDelta::new(id)),
        );
    }

    /// Take over a ban found in the store. Returns the new snapshot and
    /// selectable count, or `None` if the credential was already banned here.
    fn adopt_stored_ban(&self, id: &str) -> Option<(CredentialSnapshot, usize)> {
        let mut map = self.credentials.lock();
        let cred = map.get_mut(id)?;
        if cred.state.is_banned() {
            return None;
        }
        debug!(credential = %id, "Adopting ban from store");
        cred.set_state(CredentialState::PermanentlyBanned);
        let snapshot = cred.snapshot();
        Some((snapshot, count_selectable(map.values(), Utc::now())))
    }

    fn next_cooldown_expiry(&self) -> Option<DateTime<Utc>> {
        self.credentials
            .lock()
            .values()
            .filter_map(|c| match c.state {
                CredentialState::Cooldown { until } => Some(until),
                _ => None,
            })
            .min()
    }

    /// Broadcast degraded/recovered transitions.
    fn check_capacity(&self, available: usize) {
        let minimum = self.config.min_available;
        let degraded = available < minimum;
        let was_degraded = self.degraded.swap(degraded, Ordering::SeqCst);

        if degraded && !was_degraded {
            warn!(available, minimum, "Credential pool degraded");
            let _ = self.events.send(PoolEvent::Degraded { available, minimum });
        } else if !degraded && was_degraded {
            info!(available, "Credential pool recovered");
            let _ = self.events.send(PoolEvent::Recovered { available });
        }
    }
}

fn count_selectable<'a>(creds: impl Iterator<Item = &'a Credential>, now: DateTime<Utc>) -> usize {
    creds.filter(|c| c.state.is_selectable(now)).count()
}

fn exhausted<'a>(creds: impl Iterator<Item = &'a Credential>, now: DateTime<Utc>) -> CredentialError {
    let (mut total, mut cooling, mut banned) = (0, 0, 0);
    for c in creds {
        total += 1;
        match c.state {
            CredentialState::PermanentlyBanned => banned += 1,
            CredentialState::Cooldown { until } if now < until => cooling += 1,
            _ => {}
        }
    }
    CredentialError::Exhausted {
        total,
        cooling,
        banned,
    }
}

fn merge_cached(cred: &mut Credential, usage: &CachedUsage) {
    cred.usage_count = cred.usage_count.max(usage.usage_count);
    cred.success_count = cred.success_count.max(usage.success_count);
    cred.failure_count = cred.failure_count.max(usage.failure_count);
}
