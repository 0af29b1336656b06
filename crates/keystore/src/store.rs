//! Crash-safe file store for the secrets and stats documents
//!
//! Writes use temp file + `fsync` + atomic rename, with the previous file
//! copied to `<name>.bak` first. Reads try the primary, then the backup, then
//! fall back to an empty document. A primary that failed to load is not
//! trusted as a backup source: the next write skips the copy so a corrupted
//! file never overwrites the good backup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::codec::Codec;
use crate::document::{Envelope, SECRETS_VERSION, STATS_VERSION, SecretsDocument, StatsDocument};
use crate::error::{Error, Result};
use crate::machine::machine_seed;

/// Secrets file name inside the data directory.
pub const SECRETS_FILE: &str = "api_keys.json";
/// Stats file name inside the data directory.
pub const STATS_FILE: &str = "api_stats.json";

/// Where a loaded document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Neither primary nor backup exists (cold start)
    Missing,
    Primary,
    /// Primary was unreadable; recovered from `<name>.bak`
    Backup,
    /// Primary and backup both unreadable; started from an empty document
    Reset,
}

/// A loaded document plus recoverable corruption warnings.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    pub source: LoadSource,
    /// Always `Error::Corrupted`; empty for `Missing` and `Primary`
    pub warnings: Vec<Error>,
}

/// File-backed store for one data directory.
pub struct KeyStore {
    secrets_path: PathBuf,
    stats_path: PathBuf,
    codec: Codec,
    secrets_trusted: AtomicBool,
    stats_trusted: AtomicBool,
}

impl KeyStore {
    /// Store rooted at `dir` using an explicit codec.
    pub fn new(dir: impl AsRef<Path>, codec: Codec) -> Self {
        let dir = dir.as_ref();
        Self {
            secrets_path: dir.join(SECRETS_FILE),
            stats_path: dir.join(STATS_FILE),
            codec,
            secrets_trusted: AtomicBool::new(true),
            stats_trusted: AtomicBool::new(true),
        }
    }

    /// Store rooted at `dir` with the codec key derived from this machine.
    ///
    /// Creates `dir` if needed so the seed sees its canonical path.
    pub fn for_machine(dir: impl AsRef<Path>, kdf_iterations: u32) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Io(format!("creating data dir {}: {e}", dir.display())))?;
        let mut seed = machine_seed(dir);
        let codec = Codec::derive(&seed, kdf_iterations);
        seed.zeroize();
        Ok(Self::new(dir, codec))
    }

    pub fn secrets_path(&self) -> &Path {
        &self.secrets_path
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    /// Load and decrypt the secrets document.
    pub async fn load_secrets(&self) -> Loaded<SecretsDocument> {
        let loaded = read_with_fallback(&self.secrets_path, |bytes| {
            let envelope: Envelope = serde_json::from_slice(bytes)
                .map_err(|e| format!("parsing envelope: {e}"))?;
            let mut plain = self.codec.open(&envelope).map_err(|e| e.to_string())?;
            let parsed = serde_json::from_slice::<SecretsDocument>(&plain)
                .map_err(|e| format!("parsing secrets document: {e}"));
            plain.zeroize();
            parsed
        })
        .await;

        if loaded.value.version > SECRETS_VERSION {
            warn!(
                version = loaded.value.version,
                supported = SECRETS_VERSION,
                "secrets file written by a newer version, unknown fields will be dropped on save"
            );
        }
        self.secrets_trusted
            .store(trusted(loaded.source), Ordering::Release);
        if loaded.source != LoadSource::Missing {
            info!(
                path = %self.secrets_path.display(),
                credentials = loaded.value.credentials.len(),
                source = ?loaded.source,
                "loaded secrets"
            );
        }
        loaded
    }

    /// Load the plaintext stats document.
    pub async fn load_stats(&self) -> Loaded<StatsDocument> {
        let loaded = read_with_fallback(&self.stats_path, parse_json::<StatsDocument>).await;
        if loaded.value.version > STATS_VERSION {
            warn!(
                version = loaded.value.version,
                supported = STATS_VERSION,
                "stats file written by a newer version"
            );
        }
        self.stats_trusted
            .store(trusted(loaded.source), Ordering::Release);
        loaded
    }

    /// Seal and persist the secrets document.
    pub async fn save_secrets(&self, doc: &SecretsDocument) -> Result<()> {
        let mut plain = serde_json::to_vec(doc)
            .map_err(|e| Error::Serialize(format!("serializing secrets: {e}")))?;
        let sealed = self.codec.seal(&plain);
        plain.zeroize();
        let json = serde_json::to_vec_pretty(&sealed?)
            .map_err(|e| Error::Serialize(format!("serializing envelope: {e}")))?;

        let keep_backup = self.secrets_trusted.load(Ordering::Acquire);
        write_atomic(&self.secrets_path, &json, keep_backup).await?;
        self.secrets_trusted.store(true, Ordering::Release);
        Ok(())
    }

    /// Persist the stats document as pretty JSON.
    pub async fn save_stats(&self, doc: &StatsDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| Error::Serialize(format!("serializing stats: {e}")))?;
        let keep_backup = self.stats_trusted.load(Ordering::Acquire);
        write_atomic(&self.stats_path, &json, keep_backup).await?;
        self.stats_trusted.store(true, Ordering::Release);
        Ok(())
    }
}

fn trusted(source: LoadSource) -> bool {
    matches!(source, LoadSource::Missing | LoadSource::Primary)
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

/// Backup path for a store file: `api_keys.json` → `api_keys.json.bak`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Try primary, then backup, then an empty default.
async fn read_with_fallback<T, F>(path: &Path, decode: F) -> Loaded<T>
where
    T: Default,
    F: Fn(&[u8]) -> std::result::Result<T, String>,
{
    let backup = backup_path(path);
    let mut warnings = Vec::new();
    let mut any_present = false;

    for (candidate, source) in [(path, LoadSource::Primary), (&*backup, LoadSource::Backup)] {
        match tokio::fs::read(candidate).await {
            Ok(mut bytes) => {
                any_present = true;
                let decoded = decode(&bytes);
                bytes.zeroize();
                match decoded {
                    Ok(value) => {
                        if source == LoadSource::Backup {
                            warn!(path = %path.display(), "primary file unreadable, recovered from backup");
                        }
                        return Loaded {
                            value,
                            source,
                            warnings,
                        };
                    }
                    Err(reason) => {
                        warn!(path = %candidate.display(), error = %reason, "persisted file is corrupted");
                        warnings.push(Error::Corrupted {
                            path: candidate.to_path_buf(),
                            reason,
                        });
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %candidate.display(), "file not found");
            }
            Err(e) => {
                any_present = true;
                warn!(path = %candidate.display(), error = %e, "failed to read persisted file");
                warnings.push(Error::Corrupted {
                    path: candidate.to_path_buf(),
                    reason: format!("read failed: {e}"),
                });
            }
        }
    }

    let source = if any_present {
        warn!(path = %path.display(), "primary and backup unreadable, starting empty");
        LoadSource::Reset
    } else {
        info!(path = %path.display(), "no persisted file, starting empty");
        LoadSource::Missing
    };
    Loaded {
        value: T::default(),
        source,
        warnings,
    }
}

/// Write `bytes` to `path` atomically.
///
/// Writes a temp file in the same directory, fsyncs it, copies the current
/// file to the backup (when `keep_backup`), then renames the temp file over
/// the target. Permissions are 0600 on unix since the secrets file holds
/// credentials. The temp file is removed if any step fails.
async fn write_atomic(path: &Path, bytes: &[u8], keep_backup: bool) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating data dir: {e}")))?;

    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    if let Err(e) = replace_with_temp(path, &tmp_path, bytes, keep_backup).await {
        if let Err(remove) = tokio::fs::remove_file(&tmp_path).await
            && remove.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %tmp_path.display(), error = %remove, "failed to remove temp file");
        }
        return Err(e);
    }

    // Persist the rename itself. Not every filesystem allows it.
    if let Err(e) = sync_dir(dir).await {
        debug!(dir = %dir.display(), error = %e, "directory fsync failed, rename may not be durable");
    }

    debug!(path = %path.display(), "persisted");
    Ok(())
}

async fn replace_with_temp(
    path: &Path,
    tmp_path: &Path,
    bytes: &[u8],
    keep_backup: bool,
) -> Result<()> {
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp file: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp file: {e}")))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting file permissions: {e}")))?;
    }

    if keep_backup && tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::copy(path, backup_path(path))
            .await
            .map_err(|e| Error::Io(format!("writing backup: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file: {e}")))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
