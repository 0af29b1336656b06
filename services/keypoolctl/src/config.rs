//! Configuration types and loading
//!
//! Path precedence: `--config` > `KEYPOOL_CONFIG` > `keypool.toml`. A missing
//! file at the default path yields defaults; an explicitly chosen path must
//! exist. `KEYPOOL_DATA_DIR` overrides `storage.data_dir`.

use std::path::{Path, PathBuf};

use keypool::{ClassifierRuleConfig, PoolConfig, RetryConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "keypool.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// Where pool state lives on disk
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// PBKDF2 rounds for the machine-bound secrets key. Changing it makes
    /// existing secrets files unreadable.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

/// Lightweight authenticated request used by `keypoolctl probe`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_url")]
    pub url: String,
    /// Header that carries the key
    #[serde(default = "default_probe_header")]
    pub header: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub rules: Vec<ClassifierRuleConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".keypool")
}

fn default_kdf_iterations() -> u32 {
    keystore::DEFAULT_KDF_ITERATIONS
}

fn default_probe_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models".to_string()
}

fn default_probe_header() -> String {
    "x-goog-api-key".to_string()
}

fn default_probe_timeout() -> u64 {
    15
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: default_probe_url(),
            header: default_probe_header(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, then overlay environment variables.
    ///
    /// When `required` is false a missing file is not an error.
    pub fn load(path: &Path, required: bool) -> common::Result<Self> {
        let mut config = if !required && !path.exists() {
            Config::default()
        } else {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        };

        if let Ok(dir) = std::env::var("KEYPOOL_DATA_DIR")
            && !dir.trim().is_empty()
        {
            config.storage.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> common::Result<()> {
        self.pool.validate()?;
        self.retry.validate()?;
        for rule in &self.classifier.rules {
            rule.validate()?;
        }

        if self.storage.kdf_iterations == 0 {
            return Err(common::Error::Config(
                "storage.kdf_iterations must be greater than 0".into(),
            ));
        }

        if !self.probe.url.starts_with("http://") && !self.probe.url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "probe.url must start with http:// or https://, got: {}",
                self.probe.url
            )));
        }
        if self.probe.header.trim().is_empty() {
            return Err(common::Error::Config("probe.header must not be empty".into()));
        }
        if self.probe.timeout_secs == 0 {
            return Err(common::Error::Config(
                "probe.timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the config path. The flag is true when the path was chosen
    /// explicitly (CLI or env) and therefore must exist.
    pub fn resolve_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("KEYPOOL_CONFIG")
            && !p.trim().is_empty()
        {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keypool::ErrorKind;
    use std::sync::Mutex;

    /// Serializes tests that touch KEYPOOL_* environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("keypool.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn full_config_parses() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_DATA_DIR") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[pool]
max_keys = 10
failure_threshold = 3
key_prefix = "AIza"

[retry]
backoff_base_seconds = 1.0
backoff_max_seconds = 30.0
jitter_ratio = 0.2

[storage]
data_dir = "/var/lib/keypool"
kdf_iterations = 50000

[probe]
url = "http://127.0.0.1:9000/models"
timeout_secs = 5

[[classifier.rules]]
keyword = "billing"
kind = "invalid_request"

[[classifier.rules]]
status = 529
kind = "rate_limited"
"#,
        );

        let config = Config::load(&path, true).unwrap();
        assert_eq!(config.pool.max_keys, 10);
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.pool.key_prefix.as_deref(), Some("AIza"));
        assert_eq!(config.pool.cooldown_hours, 24);
        assert_eq!(config.retry.max_same_key_retries, 3);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/keypool"));
        assert_eq!(config.storage.kdf_iterations, 50_000);
        assert_eq!(config.probe.header, "x-goog-api-key");
        assert_eq!(config.classifier.rules.len(), 2);
        assert_eq!(config.classifier.rules[1].status, Some(529));
        assert_eq!(config.classifier.rules[1].kind, ErrorKind::RateLimited);
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_DATA_DIR") };
        let config = Config::load(Path::new("/nonexistent/keypool.toml"), false).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.storage.data_dir, PathBuf::from(".keypool"));
        assert!(config.classifier.rules.is_empty());
    }

    #[test]
    fn missing_explicit_file_is_error() {
        let result = Config::load(Path::new("/nonexistent/keypool.toml"), true);
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path, true), Err(common::Error::Toml(_))));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[pool]\nmax_key = 3\n");
        assert!(Config::load(&path, true).is_err());
    }

    #[test]
    fn data_dir_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[storage]\ndata_dir = \"/from/file\"\n");

        unsafe { set_env("KEYPOOL_DATA_DIR", "/from/env") };
        let config = Config::load(&path, true).unwrap();
        unsafe { remove_env("KEYPOOL_DATA_DIR") };
        assert_eq!(config.storage.data_dir, PathBuf::from("/from/env"));
    }

    #[test]
    fn validation_failures() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_DATA_DIR") };
        let dir = tempfile::tempdir().unwrap();
        for (contents, needle) in [
            ("[pool]\nmax_keys = 16\n", "max_keys"),
            ("[pool]\nfailure_threshold = 0\n", "failure_threshold"),
            ("[retry]\nmax_same_key_retries = 0\n", "max_same_key_retries"),
            ("[storage]\nkdf_iterations = 0\n", "kdf_iterations"),
            ("[probe]\nurl = \"ftp://example.com\"\n", "probe.url"),
            ("[probe]\ntimeout_secs = 0\n", "timeout_secs"),
            ("[probe]\nheader = \" \"\n", "probe.header"),
        ] {
            let path = write_config(&dir, contents);
            let err = Config::load(&path, true).unwrap_err().to_string();
            assert!(err.contains(needle), "{contents:?} -> {err}");
        }
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("KEYPOOL_CONFIG", "/env/keypool.toml") };
        assert_eq!(
            Config::resolve_path(Some(Path::new("/cli/wins.toml"))),
            (PathBuf::from("/cli/wins.toml"), true),
            "CLI arg must take precedence over KEYPOOL_CONFIG"
        );
        assert_eq!(
            Config::resolve_path(None),
            (PathBuf::from("/env/keypool.toml"), true)
        );

        unsafe { remove_env("KEYPOOL_CONFIG") };
        assert_eq!(
            Config::resolve_path(None),
            (PathBuf::from(DEFAULT_CONFIG_FILE), false)
        );
    }
}
