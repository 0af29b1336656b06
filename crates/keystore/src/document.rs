//! Persisted document schemas
//!
//! Both documents carry a `version` and mark every optional field
//! `#[serde(default)]`, so older files keep loading as fields are added.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub const ENVELOPE_VERSION: u32 = 1;
pub const SECRETS_VERSION: u32 = 1;
pub const STATS_VERSION: u32 = 1;

/// Operational status of a credential.
///
/// Transitions:
/// - Active → Cooldown (rate limited, or failure threshold reached)
/// - Cooldown → Active (cooldown elapsed, checked lazily; or operator reset)
/// - any → Disabled (operator action)
/// - Disabled → Active (operator reset only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    #[default]
    Active,
    Cooldown,
    Disabled,
}

impl KeyStatus {
    /// Status label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Cooldown => "cooldown",
            KeyStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// On-disk wrapper around the sealed secrets document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub cipher: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext including the authentication tag
    pub payload: String,
}

/// Full pool state minus telemetry. Only ever written sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsDocument {
    #[serde(default = "secrets_version")]
    pub version: u32,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub credentials: Vec<StoredCredential>,
}

impl Default for SecretsDocument {
    fn default() -> Self {
        Self {
            version: SECRETS_VERSION,
            current_index: 0,
            credentials: Vec::new(),
        }
    }
}

/// One credential as persisted in the secrets document.
///
/// `exhausted_at` and `added_at` are unix timestamps in milliseconds.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: String,
    pub secret: String,
    #[serde(default)]
    pub status: KeyStatus,
    #[serde(default)]
    pub exhausted_at: Option<u64>,
    #[serde(default)]
    pub added_at: u64,
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("status", &self.status)
            .field("exhausted_at", &self.exhausted_at)
            .field("added_at", &self.added_at)
            .finish()
    }
}

impl Drop for StoredCredential {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Plaintext telemetry, keyed by credential id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    #[serde(default = "stats_version")]
    pub version: u32,
    #[serde(default)]
    pub total_rotations: u64,
    #[serde(default)]
    pub last_rotation_at: Option<u64>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyStats>,
}

impl Default for StatsDocument {
    fn default() -> Self {
        Self {
            version: STATS_VERSION,
            total_rotations: 0,
            last_rotation_at: None,
            keys: BTreeMap::new(),
        }
    }
}

/// Per-credential counters. Purely observational except
/// `consecutive_failures`, which feeds the failure threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub translations: u64,
    pub sentences: u64,
    pub images: u64,
    /// Number of times the credential entered cooldown
    pub cooldowns: u64,
    pub last_used_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    /// Already sanitized by the pool before it reaches this struct
    pub last_failure_reason: Option<String>,
}

fn secrets_version() -> u32 {
    SECRETS_VERSION
}

fn stats_version() -> u32 {
    STATS_VERSION
}
