//! Credential pool and resilient invocation layer
//!
//! Owns a bounded set of interchangeable API keys for a rate-limited upstream,
//! decides which key serves the next request, reacts to rate limits and
//! transient failures, and mirrors key state and usage counters to disk.
//!
//! Key lifecycle:
//! 1. Operator adds a key → validated, fingerprinted, status `Active`
//! 2. [`Invoker::execute`] leases the current key and runs the caller's request
//! 3. Rate limit, or `failure_threshold` consecutive failures → `Cooldown`
//! 4. Cooldown elapsed → reactivated lazily the next time the key is scanned
//! 5. Operator may disable a key permanently or reset it back to `Active`
//!
//! Feature code never sees pool internals: it hands the invoker a closure that
//! performs one network call with the leased secret and returns a typed
//! [`Failure`] on error.

pub mod backoff;
pub mod classify;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod events;
pub mod invoker;
pub mod legacy;
pub mod metrics;
pub mod pool;
pub mod record;
pub mod sanitize;
pub mod stats;

pub use backoff::Backoff;
pub use classify::{Classifier, ErrorKind, Failure, Rule};
pub use config::{ClassifierRuleConfig, PoolConfig, RetryConfig};
pub use cooldown::{Clock, CooldownPolicy, ManualClock, SystemClock, Usability};
pub use error::{Error, Result};
pub use events::{CooldownReason, PoolEvent};
pub use invoker::{Invoker, Outcome};
pub use legacy::ImportReport;
pub use pool::{FailureOutcome, LoadReport, Pool};
pub use record::{KeySnapshot, Lease, Operation, Usage};
pub use stats::SummaryStats;
