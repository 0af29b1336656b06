//! Exponential backoff with jitter and cancellable waits

use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Granularity of cancellation checks while waiting.
pub const WAIT_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    /// A NaN `jitter_ratio` disables jitter.
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_nan() {
            0.0
        } else {
            jitter_ratio.clamp(0.0, 1.0)
        };
        Self {
            base,
            max,
            jitter_ratio,
        }
    }

    /// Build from seconds-based settings, rejecting values that are not
    /// positive finite durations.
    pub fn from_config(config: &RetryConfig) -> common::Result<Self> {
        config.validate()?;
        Ok(Self::new(
            config.backoff_base(),
            config.backoff_max(),
            config.jitter_ratio,
        ))
    }

    /// Delay before retry `attempt` (0-based), without jitter:
    /// `min(max, base * 2^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(62) as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// [`Backoff::base_delay`] plus uniform jitter in `[0, ratio * delay]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let spread = delay.as_secs_f64() * self.jitter_ratio;
        if spread <= 0.0 {
            return delay;
        }
        delay + Duration::from_secs_f64(rand::rng().random_range(0.0..=spread))
    }

    /// Sleep for `delay`, returning `Cancelled` as soon as `cancel` fires.
    ///
    /// The token is also polled every [`WAIT_TICK`].
    pub async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let step = remaining.min(WAIT_TICK);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(step) => {}
            }
            remaining -= step;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
