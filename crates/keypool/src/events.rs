//! Pool lifecycle notifications
//!
//! Subscribers get a `tokio::sync::broadcast` receiver from
//! [`crate::Pool::subscribe`]. Slow subscribers lag and lose old events; the
//! pool never blocks on them.

use serde::Serialize;

use crate::classify::ErrorKind;
use crate::record::Usage;

/// Broadcast channel depth. A lagging receiver sees `RecvError::Lagged`.
pub const EVENT_CAPACITY: usize = 256;

/// Why a key entered cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    RateLimited,
    /// `failure_threshold` consecutive failures
    Threshold,
}

impl CooldownReason {
    pub fn label(&self) -> &'static str {
        match self {
            CooldownReason::RateLimited => "rate_limited",
            CooldownReason::Threshold => "threshold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    KeyAdded { id: String },
    KeyRemoved { id: String },
    KeysCleared { removed: usize },
    KeyDisabled { id: String },
    /// Operator reset a key back to `Active`
    CooldownReset { id: String },
    /// `from` is `None` when there was no previous current key
    Rotated { from: Option<String>, to: String },
    CooldownEntered { id: String, reason: CooldownReason },
    /// Cooldown elapsed and the key serves again
    Reactivated { id: String },
    RequestSucceeded { id: String, usage: Usage },
    RequestFailed { id: String, kind: ErrorKind },
    StatsReset,
}
