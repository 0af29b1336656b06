//! keypoolctl
//!
//! Operator CLI for the credential pool:
//! 1. Loads config and the machine-bound key store
//! 2. Opens the pool, reporting any recovered corruption
//! 3. Runs one subcommand (add, list, stats, probe, ...)
//!
//! Ctrl-C cancels an in-flight probe, including its backoff waits.

mod commands;
mod config;
mod metrics;
mod probe;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keypool::Pool;
use keystore::KeyStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{App, Cli};
use crate::config::Config;

/// Logs go to stderr so command output on stdout stays pipeable.
///
/// Filter from `LOG_LEVEL`, then `RUST_LOG`, default `warn`.
/// `LOG_FORMAT=json` switches to structured JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let (config_path, required) = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), required, "loading configuration");
    let config = Config::load(&config_path, required)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let data_dir = &config.storage.data_dir;
    let store = KeyStore::for_machine(data_dir, config.storage.kdf_iterations)
        .with_context(|| format!("failed to open key store in {}", data_dir.display()))?;

    let (pool, report) = Pool::open(config.pool.clone(), store).await;
    for warning in &report.warnings {
        warn!(error = %warning, "recovered from unreadable state file");
    }
    info!(
        keys = report.keys_loaded,
        secrets = ?report.secrets_source,
        stats = ?report.stats_source,
        "pool ready"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let app = App::new(Arc::new(pool), &config, cancel)?;
    let mut stdout = std::io::stdout().lock();
    commands::run(&app, cli.command, &mut stdout).await
}
