//! Aggregate usage report

use keystore::KeyStatus;
use serde::Serialize;

use crate::record::KeySnapshot;

/// Pool-wide totals plus one snapshot per key, in pool order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub cooldown_keys: usize,
    pub disabled_keys: usize,
    pub current_index: Option<usize>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests, 0.0 when nothing has run yet
    pub success_rate: f64,
    pub translations: u64,
    pub sentences: u64,
    pub images: u64,
    pub total_rotations: u64,
    pub last_rotation_at: Option<u64>,
    pub keys: Vec<KeySnapshot>,
}

impl SummaryStats {
    pub(crate) fn from_snapshots(
        keys: Vec<KeySnapshot>,
        total_rotations: u64,
        last_rotation_at: Option<u64>,
    ) -> Self {
        let mut summary = SummaryStats {
            total_keys: keys.len(),
            active_keys: 0,
            cooldown_keys: 0,
            disabled_keys: 0,
            current_index: keys.iter().position(|k| k.is_current),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 0.0,
            translations: 0,
            sentences: 0,
            images: 0,
            total_rotations,
            last_rotation_at,
            keys: Vec::new(),
        };

        for key in &keys {
            match key.status {
                KeyStatus::Active => summary.active_keys += 1,
                KeyStatus::Cooldown => summary.cooldown_keys += 1,
                KeyStatus::Disabled => summary.disabled_keys += 1,
            }
            summary.total_requests += key.stats.total_requests;
            summary.successful_requests += key.stats.successful_requests;
            summary.failed_requests += key.stats.failed_requests;
            summary.translations += key.stats.translations;
            summary.sentences += key.stats.sentences;
            summary.images += key.stats.images;
        }

        summary.success_rate = success_rate(summary.successful_requests, summary.total_requests);
        summary.keys = keys;
        summary
    }
}

/// Success percentage rounded to one decimal place.
pub fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = successful as f64 / total as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}
