//! Durable storage for the credential pool
//!
//! Two files live side by side in the data directory:
//!
//! - `api_keys.json`: the secrets document (secrets, status, cooldown start,
//!   current index), serialized to JSON and sealed with [`codec::Codec`].
//! - `api_stats.json`: plaintext usage counters keyed by credential id, safe
//!   to inspect or export because it never contains secret material.
//!
//! Every write goes through a temp file, `fsync` and an atomic rename, with the
//! previous version kept as `<file>.bak`. Loads fall back from primary to
//! backup to an empty document, reporting corruption as a warning instead of
//! failing.
//!
//! The cipher key is derived from a machine-specific seed, which makes the
//! secrets file non-portable. This is obfuscation against casual inspection,
//! not protection from an attacker with access to the machine.

pub mod codec;
pub mod document;
pub mod error;
pub mod machine;
pub mod store;

pub use codec::{Codec, DEFAULT_KDF_ITERATIONS};
pub use document::{KeyStats, KeyStatus, SecretsDocument, StatsDocument, StoredCredential};
pub use error::{Error, Result};
pub use machine::machine_seed;
pub use store::{KeyStore, LoadSource, Loaded, SECRETS_FILE, STATS_FILE};
