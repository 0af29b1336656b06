//! Pool and retry tuning
//!
//! These are the `[pool]`, `[retry]` and `[[classifier.rules]]` sections of
//! the service config file. Every field has a default so an empty section (or
//! no file at all) yields a working pool.

use std::time::Duration;

use serde::Deserialize;

use crate::classify::ErrorKind;

/// Hard upper bound on pool size regardless of configuration.
pub const MAX_KEYS_LIMIT: usize = 15;

/// Key pool limits and validation policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
    /// Consecutive failures that force a key into cooldown
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u64,
    #[serde(default = "default_key_length_min")]
    pub key_length_min: usize,
    #[serde(default = "default_key_length_max")]
    pub key_length_max: usize,
    /// Required prefix for new keys, e.g. `AIza`
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Backoff and same-key retry budget for the invoker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: f64,
    /// Total attempts on one key for network/unknown failures before rotating
    #[serde(default = "default_max_same_key_retries")]
    pub max_same_key_retries: u32,
    /// Jitter is uniform in `[0, jitter_ratio * delay]`
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

/// One extra classifier rule from config. Exactly one of `keyword` or
/// `status` must be set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierRuleConfig {
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    pub kind: ErrorKind,
}

fn default_max_keys() -> usize {
    MAX_KEYS_LIMIT
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_hours() -> u64 {
    24
}

fn default_key_length_min() -> usize {
    35
}

fn default_key_length_max() -> usize {
    50
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_max() -> f64 {
    60.0
}

fn default_max_same_key_retries() -> u32 {
    3
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            failure_threshold: default_failure_threshold(),
            cooldown_hours: default_cooldown_hours(),
            key_length_min: default_key_length_min(),
            key_length_max: default_key_length_max(),
            key_prefix: None,
        }
    }
}

impl PoolConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_hours.saturating_mul(3600))
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.max_keys == 0 || self.max_keys > MAX_KEYS_LIMIT {
            return Err(common::Error::Config(format!(
                "pool.max_keys must be between 1 and {MAX_KEYS_LIMIT}, got {}",
                self.max_keys
            )));
        }
        if self.failure_threshold == 0 {
            return Err(common::Error::Config(
                "pool.failure_threshold must be at least 1".into(),
            ));
        }
        if self.key_length_min == 0 || self.key_length_min > self.key_length_max {
            return Err(common::Error::Config(format!(
                "pool.key_length_min ({}) must be positive and not exceed key_length_max ({})",
                self.key_length_min, self.key_length_max
            )));
        }
        if let Some(prefix) = &self.key_prefix
            && prefix.len() >= self.key_length_max
        {
            return Err(common::Error::Config(format!(
                "pool.key_prefix {prefix:?} is longer than key_length_max"
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_seconds: default_backoff_base(),
            backoff_max_seconds: default_backoff_max(),
            max_same_key_retries: default_max_same_key_retries(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// Only meaningful once [`RetryConfig::validate`] has passed.
    pub(crate) fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_seconds)
    }

    pub(crate) fn backoff_max(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_max_seconds)
    }

    pub fn validate(&self) -> common::Result<()> {
        // Also rejects NaN
        if !(self.backoff_base_seconds > 0.0 && self.backoff_base_seconds.is_finite()) {
            return Err(common::Error::Config(format!(
                "retry.backoff_base_seconds must be positive, got {}",
                self.backoff_base_seconds
            )));
        }
        if !(self.backoff_max_seconds >= self.backoff_base_seconds
            && self.backoff_max_seconds.is_finite())
        {
            return Err(common::Error::Config(format!(
                "retry.backoff_max_seconds ({}) must be at least backoff_base_seconds ({})",
                self.backoff_max_seconds, self.backoff_base_seconds
            )));
        }
        if self.max_same_key_retries == 0 {
            return Err(common::Error::Config(
                "retry.max_same_key_retries must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(common::Error::Config(format!(
                "retry.jitter_ratio must be within 0.0..=1.0, got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

impl ClassifierRuleConfig {
    pub fn validate(&self) -> common::Result<()> {
        match (&self.keyword, self.status) {
            (Some(keyword), None) if !keyword.trim().is_empty() => Ok(()),
            (None, Some(status)) if (100..=599).contains(&status) => Ok(()),
            _ => Err(common::Error::Config(format!(
                "classifier rule needs exactly one of a non-empty keyword or an HTTP status, got {self:?}"
            ))),
        }
    }
}
