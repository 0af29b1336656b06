//! Credential pool state machine and circular selection
//!
//! The pool holds an ordered list of keys and a `current` index. Selection
//! always prefers the current key and only moves on when it is unusable, so
//! one key serves until it is rate limited or fails too often.
//!
//! All state lives behind one `tokio::sync::Mutex`. It is held for in-memory
//! mutation and the persistence flush that follows, never across a request.
//! Cooldown expiry is checked lazily whenever a key is scanned.

use std::collections::HashSet;
use std::sync::Arc;

use keystore::{KeyStats, KeyStatus, KeyStore, LoadSource, SecretsDocument, StatsDocument};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::classify::ErrorKind;
use crate::config::PoolConfig;
use crate::cooldown::{Clock, CooldownPolicy, SystemClock, Usability};
use crate::error::{Error, Result};
use crate::events::{CooldownReason, EVENT_CAPACITY, PoolEvent};
use crate::legacy::{ImportReport, legacy_keys};
use crate::metrics;
use crate::record::{CredentialRecord, KeySnapshot, Lease, Usage, fingerprint, mask, validate_secret};
use crate::sanitize::sanitize;
use crate::stats::SummaryStats;

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Failure streak after this failure (0 if the key is gone)
    pub consecutive_failures: u32,
    /// This failure moved the key into cooldown
    pub entered_cooldown: bool,
    /// Key may still serve requests. `false` for cooling, disabled or
    /// removed keys; the invoker rotates away from them.
    pub usable: bool,
    /// Sanitized failure reason, safe to log and return
    pub reason: String,
}

/// What happened while loading persisted state.
#[derive(Debug)]
pub struct LoadReport {
    pub secrets_source: LoadSource,
    pub stats_source: LoadSource,
    /// Recoverable corruption; always `keystore::Error::Corrupted`
    pub warnings: Vec<keystore::Error>,
    pub keys_loaded: usize,
    /// Repeated secrets in the secrets file, kept once
    pub duplicates_dropped: usize,
    /// Stats entries with no matching key
    pub orphan_stats_dropped: usize,
}

/// Which files a mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Dirty {
    Clean,
    Stats,
    All,
}

impl Dirty {
    fn mark(&mut self, level: Dirty) {
        *self = (*self).max(level);
    }
}

struct PoolState {
    records: Vec<CredentialRecord>,
    current: usize,
    total_rotations: u64,
    last_rotation_at: Option<u64>,
}

impl PoolState {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            current: 0,
            total_rotations: 0,
            last_rotation_at: None,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.records.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.records.len(),
            });
        }
        Ok(())
    }

    fn secrets(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.secret.expose_str())
    }

    fn secrets_document(&self) -> SecretsDocument {
        SecretsDocument {
            current_index: self.current,
            credentials: self.records.iter().map(CredentialRecord::to_stored).collect(),
            ..SecretsDocument::default()
        }
    }

    fn stats_document(&self) -> StatsDocument {
        StatsDocument {
            total_rotations: self.total_rotations,
            last_rotation_at: self.last_rotation_at,
            keys: self
                .records
                .iter()
                .map(|r| (r.id.clone(), r.stats.clone()))
                .collect(),
            ..StatsDocument::default()
        }
    }
}

/// Pool of interchangeable API keys. Construct once and share as `Arc<Pool>`.
pub struct Pool {
    state: Mutex<PoolState>,
    store: Option<KeyStore>,
    config: PoolConfig,
    policy: CooldownPolicy,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<PoolEvent>,
}

impl Pool {
    /// Pool without persistence.
    pub fn in_memory(config: PoolConfig) -> Self {
        Self::build(config, None, PoolState::empty())
    }

    /// Load pool state from `store`. Never fails: unreadable files degrade to
    /// an empty pool and are reported in [`LoadReport::warnings`].
    pub async fn open(config: PoolConfig, store: KeyStore) -> (Self, LoadReport) {
        let secrets = store.load_secrets().await;
        let stats = store.load_stats().await;

        let mut stats_doc = stats.value;
        let mut records: Vec<CredentialRecord> = Vec::new();
        let mut seen = HashSet::new();
        let mut duplicates_dropped = 0;

        for stored in &secrets.value.credentials {
            let id = fingerprint(&stored.secret);
            if !seen.insert(id.clone()) {
                warn!(key_id = %id, "duplicate key in secrets file, keeping first");
                duplicates_dropped += 1;
                continue;
            }
            let key_stats = stats_doc
                .keys
                .remove(&id)
                .or_else(|| stats_doc.keys.remove(&stored.id))
                .unwrap_or_default();
            let mut record = CredentialRecord::from_stored(stored, key_stats);
            record.id = id;
            records.push(record);
        }

        if records.len() > config.max_keys {
            warn!(
                keys = records.len(),
                max_keys = config.max_keys,
                "persisted pool exceeds max_keys, new keys will be rejected"
            );
        }

        let orphan_stats_dropped = stats_doc.keys.len();
        if orphan_stats_dropped > 0 {
            debug!(count = orphan_stats_dropped, "dropping stats for unknown keys");
        }

        let mut current = secrets.value.current_index;
        if current >= records.len() {
            if !records.is_empty() {
                warn!(current, keys = records.len(), "current index out of range, reset to 0");
            }
            current = 0;
        }

        let state = PoolState {
            current,
            total_rotations: stats_doc.total_rotations,
            last_rotation_at: stats_doc.last_rotation_at,
            records,
        };

        let mut warnings = secrets.warnings;
        warnings.extend(stats.warnings);
        let report = LoadReport {
            secrets_source: secrets.source,
            stats_source: stats.source,
            warnings,
            keys_loaded: state.records.len(),
            duplicates_dropped,
            orphan_stats_dropped,
        };
        info!(
            keys = report.keys_loaded,
            current = state.current,
            warnings = report.warnings.len(),
            "pool loaded"
        );

        (Self::build(config, Some(store), state), report)
    }

    fn build(config: PoolConfig, store: Option<KeyStore>, state: PoolState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(state),
            store,
            policy: CooldownPolicy::new(config.cooldown()),
            config,
            clock: Arc::new(SystemClock),
            events,
        }
    }

    /// Replace the clock used for cooldown math and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ---- selection ----

    /// The current key if usable, otherwise the next usable key after it.
    ///
    /// Returns `PoolEmpty` with no keys and `PoolExhausted` when every key is
    /// cooling down or disabled.
    pub async fn current(&self) -> Result<Lease> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let mut dirty = Dirty::Clean;
        let result = self.select_current(&mut state, now, &mut dirty);
        self.persist_or_warn(&state, dirty).await;
        result
    }

    /// Advance circularly to the next usable key, starting just after the
    /// current one. The current key itself is considered last.
    pub async fn rotate_to_next(&self) -> Result<Lease> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let mut dirty = Dirty::Clean;
        let result = self.advance(&mut state, now, &mut dirty);
        self.persist_or_warn(&state, dirty).await;
        result
    }

    /// Compare-and-advance: rotate only if `expected_id` is still current.
    ///
    /// When another caller already rotated, returns the current selection
    /// instead of advancing again.
    pub async fn rotate_from(&self, expected_id: &str) -> Result<Lease> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let mut dirty = Dirty::Clean;
        let result = if state.records.is_empty() {
            Err(Error::PoolEmpty)
        } else if state.records[state.current].id != expected_id {
            debug!(expected = expected_id, "already rotated by another caller");
            self.select_current(&mut state, now, &mut dirty)
        } else {
            self.advance(&mut state, now, &mut dirty)
        };
        self.persist_or_warn(&state, dirty).await;
        result
    }

    fn select_current(&self, state: &mut PoolState, now: u64, dirty: &mut Dirty) -> Result<Lease> {
        if state.records.is_empty() {
            return Err(Error::PoolEmpty);
        }
        let index = state.current;
        if self.refresh_usable(state, index, now, dirty) {
            return Ok(state.records[index].lease(index));
        }
        self.advance(state, now, dirty)
    }

    fn advance(&self, state: &mut PoolState, now: u64, dirty: &mut Dirty) -> Result<Lease> {
        let n = state.records.len();
        if n == 0 {
            return Err(Error::PoolEmpty);
        }
        let from = state.current;

        for offset in 1..=n {
            let index = (from + offset) % n;
            if !self.refresh_usable(state, index, now, dirty) {
                continue;
            }
            if index != from {
                state.current = index;
                state.total_rotations += 1;
                state.last_rotation_at = Some(now);
                dirty.mark(Dirty::All);
                metrics::record_rotation();

                let from_id = state.records[from].id.clone();
                let to_id = state.records[index].id.clone();
                info!(from = %from_id, to = %to_id, index, "rotated to next key");
                self.emit(PoolEvent::Rotated {
                    from: Some(from_id),
                    to: to_id,
                });
            }
            return Ok(state.records[index].lease(index));
        }

        warn!(keys = n, "no usable key in pool");
        Err(Error::PoolExhausted)
    }

    /// Whether `index` may serve now, reactivating an elapsed cooldown.
    fn refresh_usable(&self, state: &mut PoolState, index: usize, now: u64, dirty: &mut Dirty) -> bool {
        let record = &mut state.records[index];
        match self.policy.check(record.status, record.exhausted_at, now) {
            Usability::Usable => true,
            Usability::Reactivate => {
                record.activate();
                dirty.mark(Dirty::All);
                info!(key_id = %record.id, "cooldown elapsed, key reactivated");
                self.emit(PoolEvent::Reactivated {
                    id: record.id.clone(),
                });
                true
            }
            Usability::Unusable { .. } => false,
        }
    }

    /// Lease the key at `index` regardless of its status, without moving
    /// `current`. Used to probe individual keys.
    pub async fn lease(&self, index: usize) -> Result<Lease> {
        let state = self.state.lock().await;
        state.check_index(index)?;
        Ok(state.records[index].lease(index))
    }

    // ---- outcome bookkeeping ----

    /// Record a successful request: counters, feature usage, reset streak.
    ///
    /// A key removed while its request was in flight is ignored.
    pub async fn mark_success(&self, id: &str, usage: Usage) {
        let mut state = self.state.lock().await;
        let now = self.now();
        let Some(index) = state.position(id) else {
            debug!(key_id = id, "success for removed key ignored");
            return;
        };

        let record = &mut state.records[index];
        record.stats.total_requests += 1;
        record.stats.successful_requests += 1;
        record.stats.consecutive_failures = 0;
        record.stats.last_used_at = Some(now);
        usage.apply(&mut record.stats);

        metrics::record_success();
        debug!(key_id = id, operation = ?usage.operation, "request succeeded");
        self.emit(PoolEvent::RequestSucceeded {
            id: id.to_string(),
            usage,
        });
        self.persist_or_warn(&state, Dirty::Stats).await;
    }

    /// Record a failed request and apply the cooldown rules.
    ///
    /// `RateLimited`, or reaching `failure_threshold` consecutive failures,
    /// moves an active key into cooldown. A key that is already cooling keeps
    /// its original `exhausted_at`.
    pub async fn mark_failure(&self, id: &str, kind: ErrorKind, reason: &str) -> FailureOutcome {
        let mut state = self.state.lock().await;
        let now = self.now();
        let reason = sanitize(reason, state.secrets());
        metrics::record_failure(kind);

        let Some(index) = state.position(id) else {
            debug!(key_id = id, kind = %kind, "failure for removed key ignored");
            return FailureOutcome {
                consecutive_failures: 0,
                entered_cooldown: false,
                usable: false,
                reason,
            };
        };

        let threshold = self.config.failure_threshold;
        let record = &mut state.records[index];
        record.stats.total_requests += 1;
        record.stats.failed_requests += 1;
        record.stats.consecutive_failures = record.stats.consecutive_failures.saturating_add(1);
        record.stats.last_failure_at = Some(now);
        record.stats.last_failure_reason = Some(reason.clone());
        let streak = record.stats.consecutive_failures;

        warn!(key_id = id, kind = %kind, consecutive = streak, reason = %reason, "request failed");
        self.emit(PoolEvent::RequestFailed {
            id: id.to_string(),
            kind,
        });

        let mut dirty = Dirty::Stats;
        let mut entered_cooldown = false;
        if record.status == KeyStatus::Active {
            let cause = if kind == ErrorKind::RateLimited {
                Some(CooldownReason::RateLimited)
            } else if streak >= threshold {
                Some(CooldownReason::Threshold)
            } else {
                None
            };
            if let Some(cause) = cause {
                record.status = KeyStatus::Cooldown;
                record.exhausted_at = Some(now);
                record.stats.cooldowns += 1;
                entered_cooldown = true;
                dirty.mark(Dirty::All);
                metrics::record_cooldown(cause);
                info!(
                    key_id = id,
                    reason = cause.label(),
                    cooldown_secs = self.policy.duration().as_secs(),
                    "key entering cooldown"
                );
                self.emit(PoolEvent::CooldownEntered {
                    id: id.to_string(),
                    reason: cause,
                });
            }
        }
        let usable = record.status == KeyStatus::Active;

        self.persist_or_warn(&state, dirty).await;
        FailureOutcome {
            consecutive_failures: streak,
            entered_cooldown,
            usable,
            reason,
        }
    }

    /// Sanitize arbitrary text against the pool's secrets.
    pub async fn sanitize(&self, text: &str) -> String {
        let state = self.state.lock().await;
        sanitize(text, state.secrets())
    }

    // ---- administration ----

    /// Validate and append a key. Rejects duplicates and a full pool.
    pub async fn add_key(&self, raw: &str) -> Result<KeySnapshot> {
        let secret = validate_secret(raw, &self.config)?;
        let mut state = self.state.lock().await;
        let now = self.now();
        let index = self.insert(&mut state, secret, now)?;
        self.persist(&state, Dirty::All).await?;
        Ok(self.snapshot(&state, index, now))
    }

    fn insert(&self, state: &mut PoolState, secret: String, now: u64) -> Result<usize> {
        let id = fingerprint(&secret);
        if state.position(&id).is_some() {
            return Err(Error::DuplicateKey(mask(&secret)));
        }
        if state.records.len() >= self.config.max_keys {
            return Err(Error::PoolFull {
                max: self.config.max_keys,
            });
        }
        state.records.push(CredentialRecord::new(secret, now));
        info!(key_id = %id, keys = state.records.len(), "key added");
        self.emit(PoolEvent::KeyAdded { id });
        Ok(state.records.len() - 1)
    }

    /// Remove the key at `index`, keeping `current` on the same key when it
    /// was after the removed one.
    pub async fn remove_key(&self, index: usize) -> Result<KeySnapshot> {
        let mut state = self.state.lock().await;
        state.check_index(index)?;
        let now = self.now();
        let snapshot = self.snapshot(&state, index, now);

        state.records.remove(index);
        let len = state.records.len();
        if index < state.current {
            state.current -= 1;
        } else if state.current >= len {
            state.current = len.saturating_sub(1);
        }

        info!(key_id = %snapshot.id, keys = len, "key removed");
        self.emit(PoolEvent::KeyRemoved {
            id: snapshot.id.clone(),
        });
        self.persist(&state, Dirty::All).await?;
        Ok(snapshot)
    }

    /// Remove every key. Returns how many were removed.
    pub async fn clear_all_keys(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let removed = state.records.len();
        state.records.clear();
        state.current = 0;
        info!(removed, "all keys cleared");
        self.emit(PoolEvent::KeysCleared { removed });
        self.persist(&state, Dirty::All).await?;
        Ok(removed)
    }

    /// Operator override: put the key back to `Active` regardless of status.
    pub async fn reset_cooldown(&self, index: usize) -> Result<KeySnapshot> {
        let mut state = self.state.lock().await;
        state.check_index(index)?;
        let record = &mut state.records[index];
        let previous = record.status;
        record.activate();
        info!(key_id = %record.id, previous = %previous, "key reset to active");
        self.emit(PoolEvent::CooldownReset {
            id: record.id.clone(),
        });
        self.persist(&state, Dirty::All).await?;
        Ok(self.snapshot(&state, index, self.now()))
    }

    /// Permanently disable the key at `index` until an operator resets it.
    pub async fn disable_key(&self, index: usize) -> Result<KeySnapshot> {
        let mut state = self.state.lock().await;
        state.check_index(index)?;
        let record = &mut state.records[index];
        record.status = KeyStatus::Disabled;
        record.exhausted_at = None;
        info!(key_id = %record.id, "key disabled");
        self.emit(PoolEvent::KeyDisabled {
            id: record.id.clone(),
        });
        self.persist(&state, Dirty::All).await?;
        Ok(self.snapshot(&state, index, self.now()))
    }

    /// Force the current selection. Not counted as a rotation.
    pub async fn set_current(&self, index: usize) -> Result<KeySnapshot> {
        let mut state = self.state.lock().await;
        state.check_index(index)?;
        if state.current != index {
            let from = state.records.get(state.current).map(|r| r.id.clone());
            state.current = index;
            let to = state.records[index].id.clone();
            info!(key_id = %to, index, "current key set");
            self.emit(PoolEvent::Rotated { from, to });
            self.persist(&state, Dirty::All).await?;
        }
        Ok(self.snapshot(&state, index, self.now()))
    }

    /// Zero every usage counter and the rotation totals. Keys, status and
    /// failure streaks are kept.
    pub async fn reset_stats(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for record in &mut state.records {
            record.stats = KeyStats {
                consecutive_failures: record.stats.consecutive_failures,
                ..KeyStats::default()
            };
        }
        state.total_rotations = 0;
        state.last_rotation_at = None;
        info!("usage statistics reset");
        self.emit(PoolEvent::StatsReset);
        self.persist(&state, Dirty::Stats).await?;
        Ok(())
    }

    /// Import keys from a legacy config document.
    ///
    /// Invalid and duplicate entries are counted and skipped; the import
    /// stops adding once the pool is full.
    pub async fn import_legacy(&self, json: &str) -> Result<ImportReport> {
        let candidates = legacy_keys(json)?;
        let mut report = ImportReport::default();
        let mut state = self.state.lock().await;
        let now = self.now();

        for raw in candidates {
            let secret = match validate_secret(&raw, &self.config) {
                Ok(secret) => secret,
                Err(e) => {
                    debug!(error = %e, "skipping invalid legacy key");
                    report.invalid += 1;
                    continue;
                }
            };
            match self.insert(&mut state, secret, now) {
                Ok(_) => report.imported += 1,
                Err(Error::DuplicateKey(_)) => report.duplicates += 1,
                Err(Error::PoolFull { .. }) => report.skipped_full += 1,
                Err(e) => return Err(e),
            }
        }

        info!(
            imported = report.imported,
            duplicates = report.duplicates,
            invalid = report.invalid,
            skipped_full = report.skipped_full,
            "legacy import finished"
        );
        if report.imported > 0 {
            self.persist(&state, Dirty::All).await?;
        }
        Ok(report)
    }

    // ---- reporting ----

    /// `AIza...wxyz` style display form of every key, in pool order.
    pub async fn masked_keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.records.iter().map(CredentialRecord::masked).collect()
    }

    pub async fn snapshots(&self) -> Vec<KeySnapshot> {
        let state = self.state.lock().await;
        let now = self.now();
        (0..state.records.len())
            .map(|i| self.snapshot(&state, i, now))
            .collect()
    }

    pub async fn summary_stats(&self) -> SummaryStats {
        let state = self.state.lock().await;
        let now = self.now();
        let keys = (0..state.records.len())
            .map(|i| self.snapshot(&state, i, now))
            .collect();
        SummaryStats::from_snapshots(keys, state.total_rotations, state.last_rotation_at)
    }

    fn snapshot(&self, state: &PoolState, index: usize, now: u64) -> KeySnapshot {
        let record = &state.records[index];
        let usability = self.policy.check(record.status, record.exhausted_at, now);
        let status = match usability {
            Usability::Reactivate => KeyStatus::Active,
            _ => record.status,
        };
        let cooldown_remaining_secs = match usability {
            Usability::Unusable {
                remaining_ms: Some(ms),
            } => Some(ms.div_ceil(1000)),
            _ => None,
        };
        KeySnapshot {
            index,
            id: record.id.clone(),
            masked: record.masked(),
            status,
            is_current: index == state.current,
            added_at: record.added_at,
            exhausted_at: record.exhausted_at,
            cooldown_remaining_secs,
            stats: record.stats.clone(),
        }
    }

    // ---- plumbing ----

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&self, state: &PoolState, dirty: Dirty) -> keystore::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if dirty >= Dirty::All {
            store.save_secrets(&state.secrets_document()).await?;
        }
        if dirty >= Dirty::Stats {
            store.save_stats(&state.stats_document()).await?;
        }
        Ok(())
    }

    /// Flush for request-path mutations. The in-memory state stays
    /// authoritative; the next successful flush catches the files up.
    async fn persist_or_warn(&self, state: &PoolState, dirty: Dirty) {
        if let Err(e) = self.persist(state, dirty).await {
            warn!(error = %e, "failed to persist pool state");
        }
    }
}
