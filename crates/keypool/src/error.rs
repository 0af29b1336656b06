//! Error types for pool and invoker operations

use crate::classify::ErrorKind;

/// Errors from pool management and request execution.
///
/// Messages never contain secret material: failure reasons are sanitized by
/// the pool before they are wrapped here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid key: {0}")]
    Validation(String),

    #[error("key already configured: {0}")]
    DuplicateKey(String),

    #[error("pool is full ({max} keys)")]
    PoolFull { max: usize },

    #[error("no credentials configured")]
    PoolEmpty,

    #[error("all configured credentials are currently unavailable, try again later or add more")]
    PoolExhausted,

    #[error("no key at index {index} (pool has {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Unknown(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Store(#[from] keystore::Error),

    #[error(transparent)]
    Config(#[from] common::Error),
}

impl Error {
    /// Wrap an already sanitized failure reason in the variant for `kind`.
    pub fn from_kind(kind: ErrorKind, reason: String) -> Self {
        match kind {
            ErrorKind::RateLimited => Error::RateLimited(reason),
            ErrorKind::Network => Error::Network(reason),
            ErrorKind::InvalidRequest => Error::InvalidRequest(reason),
            ErrorKind::Unknown => Error::Unknown(reason),
        }
    }

    /// Whether a caller may reasonably try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted | Error::RateLimited(_) | Error::Network(_) | Error::Unknown(_)
        )
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
