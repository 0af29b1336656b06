//! Pool metrics
//!
//! Emitted through the `metrics` facade; without an installed recorder every
//! call is a no-op.
//!
//! - `keypool_requests_total` (counter): label `outcome`
//! - `keypool_rotations_total` (counter)
//! - `keypool_cooldowns_total` (counter): label `reason`
//! - `keypool_backoff_seconds` (histogram)

use crate::classify::ErrorKind;
use crate::events::CooldownReason;

pub fn record_success() {
    metrics::counter!("keypool_requests_total", "outcome" => "success").increment(1);
}

pub fn record_failure(kind: ErrorKind) {
    metrics::counter!("keypool_requests_total", "outcome" => kind.label()).increment(1);
}

pub fn record_rotation() {
    metrics::counter!("keypool_rotations_total").increment(1);
}

pub fn record_cooldown(reason: CooldownReason) {
    metrics::counter!("keypool_cooldowns_total", "reason" => reason.label()).increment(1);
}

pub fn record_backoff(seconds: f64) {
    metrics::histogram!("keypool_backoff_seconds").record(seconds);
}
