//! Resilient request execution over the pool
//!
//! [`Invoker::execute`] leases the current key, runs the caller's request and
//! decides what to do with a failure:
//!
//! - `InvalidRequest`: give up immediately, rotating would not help
//! - `RateLimited`: the key is cooled down by the pool, move to the next key
//! - `Network` / `Unknown`: back off and retry on the same key, rotating once
//!   `max_same_key_retries` attempts are spent or the key entered cooldown
//!
//! Each key is tried at most once per call. Landing on a key already tried
//! ends the call with the last observed error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use common::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::classify::{Classifier, ErrorKind, Failure};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pool::Pool;
use crate::record::Usage;

/// A successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    /// Fingerprint of the key that served the request
    pub key_id: String,
    /// Request attempts made, including the successful one
    pub attempts: u32,
}

pub struct Invoker {
    pool: Arc<Pool>,
    classifier: Classifier,
    backoff: Backoff,
    max_same_key_retries: u32,
}

impl Invoker {
    /// Fails with [`Error::Config`] when `retry` does not validate.
    pub fn new(pool: Arc<Pool>, retry: &RetryConfig) -> Result<Self> {
        Ok(Self {
            pool,
            classifier: Classifier::default(),
            backoff: Backoff::from_config(retry)?,
            max_same_key_retries: retry.max_same_key_retries.max(1),
        })
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Run `request` with a pooled key until it succeeds or the pool gives up.
    ///
    /// `request` performs exactly one upstream call with the secret it is
    /// handed. `usage` is credited to the serving key on success.
    ///
    /// # Errors
    ///
    /// `PoolEmpty` / `PoolExhausted` when no key can serve, `Cancelled` when
    /// `cancel` fires before an attempt or during a backoff wait, otherwise the
    /// classified error of the last failed attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        usage: Usage,
        cancel: &CancellationToken,
        mut request: F,
    ) -> Result<Outcome<T>>
    where
        F: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut lease = self.pool.current().await?;
        let mut tried = HashSet::from([lease.id.clone()]);
        let mut same_key_attempts = 0u32;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempts += 1;

            let failure = match request(lease.secret.clone()).await {
                Ok(value) => {
                    self.pool.mark_success(&lease.id, usage).await;
                    return Ok(Outcome {
                        value,
                        key_id: lease.id,
                        attempts,
                    });
                }
                Err(failure) => failure,
            };

            let kind = self.classifier.classify(&failure);
            let outcome = self
                .pool
                .mark_failure(&lease.id, kind, &failure.to_string())
                .await;
            same_key_attempts += 1;
            let usable = outcome.usable;
            let last_error = Error::from_kind(kind, outcome.reason);

            let rotate = match kind {
                ErrorKind::InvalidRequest => return Err(last_error),
                ErrorKind::RateLimited => true,
                ErrorKind::Network | ErrorKind::Unknown => {
                    !usable || same_key_attempts >= self.max_same_key_retries
                }
            };

            if !rotate {
                let delay = self.backoff.delay(same_key_attempts - 1);
                debug!(
                    key_id = %lease.id,
                    attempt = same_key_attempts,
                    delay_ms = delay.as_millis() as u64,
                    kind = %kind,
                    "retrying same key after backoff"
                );
                metrics::record_backoff(delay.as_secs_f64());
                self.backoff.wait(delay, cancel).await?;
                continue;
            }

            let next = self.pool.rotate_from(&lease.id).await?;
            if !tried.insert(next.id.clone()) {
                warn!(key_id = %next.id, attempts, kind = %kind, "no untried key left");
                return Err(last_error);
            }
            info!(from = %lease.id, to = %next.id, kind = %kind, "retrying with next key");
            lease = next;
            same_key_attempts = 0;
        }
    }
}
