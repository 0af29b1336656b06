//! Wall-clock helpers
//!
//! Every persisted timestamp in the workspace is a unix timestamp in
//! milliseconds, so records survive restarts without `Instant` state.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds. A clock set before the epoch reads as 0.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
