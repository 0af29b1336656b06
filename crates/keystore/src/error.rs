//! Error types for persistence operations

use std::path::PathBuf;

/// Errors from reading, writing or decoding persisted pool state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    /// A file exists but cannot be decoded. Loads recover from this by falling
    /// back to the backup or an empty document; it only ever surfaces as a
    /// warning in [`crate::Loaded`].
    #[error("persisted state corrupted at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Result alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;
