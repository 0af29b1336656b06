//! Lazy cooldown decisions
//!
//! There are no timers: whether a cooled-down key may serve again is computed
//! from its `exhausted_at` timestamp whenever the pool scans it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use keystore::KeyStatus;

/// Source of unix-millis timestamps for cooldown math and bookkeeping.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        common::now_millis()
    }
}

/// Clock that only moves when told to. Used to step through cooldown windows.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Result of checking a key against the cooldown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Usable,
    /// Cooldown has elapsed; the caller should flip the key back to `Active`
    Reactivate,
    /// Disabled, or still cooling down with `remaining_ms` to go
    Unusable { remaining_ms: Option<u64> },
}

impl Usability {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Usability::Unusable { .. })
    }
}

/// Pure decision: may a key with this status serve a request at `now`?
#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    duration_ms: u64,
}

impl CooldownPolicy {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// A `Cooldown` key without a timestamp is treated as already expired.
    pub fn check(&self, status: KeyStatus, exhausted_at: Option<u64>, now: u64) -> Usability {
        match status {
            KeyStatus::Active => Usability::Usable,
            KeyStatus::Disabled => Usability::Unusable { remaining_ms: None },
            KeyStatus::Cooldown => {
                let Some(since) = exhausted_at else {
                    return Usability::Reactivate;
                };
                let until = since.saturating_add(self.duration_ms);
                if now >= until {
                    Usability::Reactivate
                } else {
                    Usability::Unusable {
                        remaining_ms: Some(until - now),
                    }
                }
            }
        }
    }

    /// Milliseconds until a cooling key becomes eligible again; `None` when
    /// the key is not cooling down or the window has already elapsed.
    pub fn remaining_ms(&self, status: KeyStatus, exhausted_at: Option<u64>, now: u64) -> Option<u64> {
        match self.check(status, exhausted_at, now) {
            Usability::Unusable { remaining_ms } => remaining_ms,
            _ => None,
        }
    }
}
