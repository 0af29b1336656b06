//! Machine-specific seed for the secrets file key

use std::path::{Path, PathBuf};

use tracing::debug;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Build the key-derivation seed for `data_dir`.
///
/// Combines a stable OS identifier (systemd/dbus machine id, else the host
/// name) with the canonical data directory path. Moving the secrets file to
/// another machine, or to another directory, makes it unreadable; the pool
/// then starts empty with a corruption warning.
pub fn machine_seed(data_dir: &Path) -> Vec<u8> {
    let mut seed = Vec::new();

    match read_machine_id() {
        Some(id) => {
            debug!("using OS machine id for key derivation");
            seed.extend_from_slice(id.as_bytes());
        }
        None => {
            let host = host_name().unwrap_or_default();
            debug!("machine id unavailable, using host name for key derivation");
            seed.extend_from_slice(host.as_bytes());
        }
    }

    seed.push(0);
    let dir = std::fs::canonicalize(data_dir).unwrap_or_else(|_| PathBuf::from(data_dir));
    seed.extend_from_slice(dir.to_string_lossy().as_bytes());
    seed
}

fn read_machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
