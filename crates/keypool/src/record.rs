//! In-memory credential records and the views handed out of the pool

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use keystore::{KeyStats, KeyStatus, StoredCredential};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

const FINGERPRINT_CHARS: usize = 12;

/// Stable, non-reversible identifier for a secret: `key-` plus the first 12
/// characters of its base64url SHA-256.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    format!("key-{}", &encoded[..FINGERPRINT_CHARS])
}

/// Display form of a secret: first 4 and last 4 characters.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Trim and check a candidate key against the configured policy.
pub fn validate_secret(raw: &str, config: &PoolConfig) -> Result<String> {
    let secret = raw.trim();
    if secret.is_empty() {
        return Err(Error::Validation("key is empty".into()));
    }

    let len = secret.chars().count();
    if len < config.key_length_min || len > config.key_length_max {
        return Err(Error::Validation(format!(
            "key length must be between {} and {} characters, got {len}",
            config.key_length_min, config.key_length_max
        )));
    }

    if let Some(bad) = secret
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        let shown = if bad.is_ascii_graphic() {
            format!("{bad:?}")
        } else {
            format!("U+{:04X}", bad as u32)
        };
        return Err(Error::Validation(format!(
            "key may only contain letters, digits, '-' and '_' (found {shown})"
        )));
    }

    if let Some(prefix) = &config.key_prefix
        && !secret.starts_with(prefix.as_str())
    {
        return Err(Error::Validation(format!("key must start with {prefix:?}")));
    }

    Ok(secret.to_string())
}

/// Feature that consumed a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Translation,
    Sentence,
    Image,
    Other,
}

/// What a successful request produced, for the per-feature counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub operation: Operation,
    pub count: u64,
}

impl Usage {
    pub fn translation(count: u64) -> Self {
        Self {
            operation: Operation::Translation,
            count,
        }
    }

    pub fn sentence(count: u64) -> Self {
        Self {
            operation: Operation::Sentence,
            count,
        }
    }

    pub fn image(count: u64) -> Self {
        Self {
            operation: Operation::Image,
            count,
        }
    }

    /// Health checks and anything that should not touch feature counters.
    pub fn other() -> Self {
        Self {
            operation: Operation::Other,
            count: 0,
        }
    }

    pub(crate) fn apply(&self, stats: &mut KeyStats) {
        let counter = match self.operation {
            Operation::Translation => &mut stats.translations,
            Operation::Sentence => &mut stats.sentences,
            Operation::Image => &mut stats.images,
            Operation::Other => return,
        };
        *counter = counter.saturating_add(self.count);
    }
}

/// Authoritative in-memory state of one key.
#[derive(Debug)]
pub(crate) struct CredentialRecord {
    pub id: String,
    pub secret: Secret<String>,
    pub status: KeyStatus,
    pub exhausted_at: Option<u64>,
    pub added_at: u64,
    pub stats: KeyStats,
}

impl CredentialRecord {
    pub fn new(secret: String, now: u64) -> Self {
        Self {
            id: fingerprint(&secret),
            secret: Secret::new(secret),
            status: KeyStatus::Active,
            exhausted_at: None,
            added_at: now,
            stats: KeyStats::default(),
        }
    }

    pub fn from_stored(stored: &StoredCredential, stats: KeyStats) -> Self {
        Self {
            id: stored.id.clone(),
            secret: Secret::new(stored.secret.clone()),
            status: stored.status,
            exhausted_at: stored.exhausted_at,
            added_at: stored.added_at,
            stats,
        }
    }

    pub fn to_stored(&self) -> StoredCredential {
        StoredCredential {
            id: self.id.clone(),
            secret: self.secret.expose().clone(),
            status: self.status,
            exhausted_at: self.exhausted_at,
            added_at: self.added_at,
        }
    }

    pub fn activate(&mut self) {
        self.status = KeyStatus::Active;
        self.exhausted_at = None;
        self.stats.consecutive_failures = 0;
    }

    pub fn masked(&self) -> String {
        mask(self.secret.expose_str())
    }

    pub fn lease(&self, index: usize) -> Lease {
        Lease {
            id: self.id.clone(),
            index,
            secret: self.secret.clone(),
        }
    }
}

/// A key selected to serve one request attempt.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub index: usize,
    pub secret: Secret<String>,
}

/// Secret-free view of a key for reports and admin output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub id: String,
    pub masked: String,
    /// Effective status: a cooldown that has already elapsed reports `Active`
    pub status: KeyStatus,
    pub is_current: bool,
    pub added_at: u64,
    pub exhausted_at: Option<u64>,
    pub cooldown_remaining_secs: Option<u64>,
    pub stats: KeyStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "AIzaSyTestKey1234567890abcdefghijklmn";

    #[test]
    fn fingerprint_is_stable_and_prefixed() {
        let id = fingerprint(KEY);
        assert!(id.starts_with("key-"));
        assert_eq!(id.len(), 4 + FINGERPRINT_CHARS);
        assert_eq!(id, fingerprint(KEY));
        assert_ne!(id, fingerprint("AIzaSyTestKey1234567890abcdefghijklmo"));
        assert!(!id.contains(&KEY[4..12]));
    }

    #[test]
    fn mask_shows_first_and_last_four() {
        assert_eq!(mask(KEY), "AIza...klmn");
        assert_eq!(mask("short"), "*****");
    }

    #[test]
    fn validate_trims_and_accepts() {
        let config = PoolConfig::default();
        assert_eq!(validate_secret(&format!("  {KEY}\n"), &config).unwrap(), KEY);
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let config = PoolConfig::default();
        let too_long = "x".repeat(51);
        for bad in ["", "   ", "AIza-too-short", too_long.as_str()] {
            let err = validate_secret(bad, &config).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{bad:?}: {err}");
        }
        let with_space = "AIzaSyTestKey1234567890 abcdefghijklmn";
        assert!(validate_secret(with_space, &config).is_err());
        let with_symbol = "AIzaSyTestKey1234567890$abcdefghijklm";
        let err = validate_secret(with_symbol, &config).unwrap_err();
        assert!(err.to_string().contains("'$'"), "got: {err}");
    }

    #[test]
    fn validation_error_never_echoes_key() {
        let config = PoolConfig::default();
        let bad = "AIzaSyTestKey1234567890$abcdefghijklm";
        let err = validate_secret(bad, &config).unwrap_err().to_string();
        assert!(!err.contains("AIzaSy"), "got: {err}");
    }

    #[test]
    fn validate_enforces_prefix() {
        let config = PoolConfig {
            key_prefix: Some("AIza".into()),
            ..PoolConfig::default()
        };
        assert!(validate_secret(KEY, &config).is_ok());
        let err = validate_secret("BIzaSyTestKey1234567890abcdefghijklmn", &config).unwrap_err();
        assert!(err.to_string().contains("AIza"));
    }

    #[test]
    fn usage_increments_feature_counter() {
        let mut stats = KeyStats::default();
        Usage::translation(3).apply(&mut stats);
        Usage::sentence(1).apply(&mut stats);
        Usage::image(2).apply(&mut stats);
        Usage::other().apply(&mut stats);
        assert_eq!((stats.translations, stats.sentences, stats.images), (3, 1, 2));
    }
}
