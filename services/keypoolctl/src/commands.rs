//! Subcommands and their output
//!
//! Every command writes to the `out` writer it is handed so the same code
//! serves the terminal and the tests. Secrets are never printed; keys are
//! shown masked and addressed by index.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use keypool::{Classifier, Invoker, KeySnapshot, Pool, Usage};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::metrics;
use crate::probe::Prober;

#[derive(Debug, Parser)]
#[command(name = "keypoolctl", version, about = "Manage a rotating pool of API keys")]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a key. Reads it from stdin when omitted to keep it out of shell history
    Add { key: Option<String> },
    /// Remove the key at INDEX
    Remove { index: usize },
    /// List keys with status and counters
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show pool-wide usage statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Put the key at INDEX back into service
    ResetCooldown { index: usize },
    /// Take the key at INDEX out of service until reset
    Disable { index: usize },
    /// Make the key at INDEX the current one
    Use { index: usize },
    /// Remove every key
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Zero usage counters, keeping keys and their status
    ResetStats,
    /// Import keys from a legacy JSON config file
    Import { path: PathBuf },
    /// Send an authenticated request through the pool
    Probe {
        /// Probe every key individually instead of one pooled request
        #[arg(long)]
        all: bool,
        /// Print Prometheus metrics collected during the probe
        #[arg(long)]
        metrics: bool,
    },
}

/// Everything a command needs, built once at startup.
pub struct App {
    pub pool: Arc<Pool>,
    pub invoker: Invoker,
    pub prober: Prober,
    pub cancel: CancellationToken,
}

impl App {
    pub fn new(pool: Arc<Pool>, config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let invoker = Invoker::new(pool.clone(), &config.retry)?
            .with_classifier(Classifier::from_config(&config.classifier.rules));
        let prober = Prober::new(&config.probe)?;
        Ok(Self {
            pool,
            invoker,
            prober,
            cancel,
        })
    }
}

pub async fn run(app: &App, command: Command, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Command::Add { key } => {
            let key = match key {
                Some(key) => key,
                None => read_key_from_stdin().await?,
            };
            let snapshot = app.pool.add_key(&key).await?;
            writeln!(out, "added {} at index {}", snapshot.masked, snapshot.index)?;
        }
        Command::Remove { index } => {
            let snapshot = app.pool.remove_key(index).await?;
            writeln!(out, "removed {} (was index {index})", snapshot.masked)?;
        }
        Command::List { json } => {
            let keys = app.pool.snapshots().await;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&keys)?)?;
            } else {
                write_key_table(out, &keys)?;
            }
        }
        Command::Stats { json } => {
            let summary = app.pool.summary_stats().await;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
                return Ok(());
            }
            writeln!(
                out,
                "keys:       {} ({} active, {} cooldown, {} disabled)",
                summary.total_keys, summary.active_keys, summary.cooldown_keys, summary.disabled_keys
            )?;
            writeln!(
                out,
                "requests:   {} ({} ok, {} failed, {:.1}% success)",
                summary.total_requests,
                summary.successful_requests,
                summary.failed_requests,
                summary.success_rate
            )?;
            writeln!(
                out,
                "features:   {} translations, {} sentences, {} images",
                summary.translations, summary.sentences, summary.images
            )?;
            writeln!(out, "rotations:  {}", summary.total_rotations)?;
            writeln!(out)?;
            write_key_table(out, &summary.keys)?;
        }
        Command::ResetCooldown { index } => {
            let snapshot = app.pool.reset_cooldown(index).await?;
            writeln!(out, "{} is active again", snapshot.masked)?;
        }
        Command::Disable { index } => {
            let snapshot = app.pool.disable_key(index).await?;
            writeln!(out, "{} disabled", snapshot.masked)?;
        }
        Command::Use { index } => {
            let snapshot = app.pool.set_current(index).await?;
            writeln!(out, "current key is now {} (index {index})", snapshot.masked)?;
        }
        Command::Clear { yes } => {
            let count = app.pool.len().await;
            if !yes {
                bail!("refusing to remove {count} keys without --yes");
            }
            let removed = app.pool.clear_all_keys().await?;
            writeln!(out, "removed {removed} keys")?;
        }
        Command::ResetStats => {
            app.pool.reset_stats().await?;
            writeln!(out, "usage statistics reset")?;
        }
        Command::Import { path } => {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let report = app.pool.import_legacy(&contents).await?;
            writeln!(
                out,
                "imported {} of {} keys ({} duplicate, {} invalid, {} over capacity)",
                report.imported,
                report.total_seen(),
                report.duplicates,
                report.invalid,
                report.skipped_full
            )?;
        }
        Command::Probe {
            all,
            metrics: with_metrics,
        } => {
            let handle = if with_metrics {
                Some(metrics::install_recorder()?)
            } else {
                None
            };
            if all {
                probe_each(app, out).await?;
            } else {
                probe_pooled(app, out).await?;
            }
            if let Some(handle) = handle {
                writeln!(out)?;
                write!(out, "{}", handle.render())?;
            }
        }
    }
    Ok(())
}

/// One request through the invoker, rotating as needed.
async fn probe_pooled(app: &App, out: &mut impl Write) -> anyhow::Result<()> {
    info!(url = app.prober.url(), "probing through pool");
    let prober = &app.prober;
    let outcome = app
        .invoker
        .execute(Usage::other(), &app.cancel, move |secret| prober.check(secret))
        .await
        .context("probe failed")?;

    let masked = app
        .pool
        .snapshots()
        .await
        .into_iter()
        .find(|k| k.id == outcome.key_id)
        .map(|k| k.masked)
        .unwrap_or_else(|| outcome.key_id.clone());
    writeln!(
        out,
        "ok: {masked} answered HTTP {} after {} attempt(s)",
        outcome.value, outcome.attempts
    )?;
    Ok(())
}

/// Probe every key once, recording each outcome in the pool.
async fn probe_each(app: &App, out: &mut impl Write) -> anyhow::Result<()> {
    let total = app.pool.len().await;
    if total == 0 {
        bail!(keypool::Error::PoolEmpty);
    }

    for index in 0..total {
        let lease = app.pool.lease(index).await?;
        let result = tokio::select! {
            biased;
            _ = app.cancel.cancelled() => bail!(keypool::Error::Cancelled),
            result = app.prober.check(lease.secret.clone()) => result,
        };
        let masked = keypool::record::mask(lease.secret.expose_str());

        match result {
            Ok(status) => {
                app.pool.mark_success(&lease.id, Usage::other()).await;
                writeln!(out, "{index:>2}  {masked}  ok (HTTP {status})")?;
            }
            Err(failure) => {
                let kind = app.invoker.classifier().classify(&failure);
                let outcome = app
                    .pool
                    .mark_failure(&lease.id, kind, &failure.to_string())
                    .await;
                writeln!(out, "{index:>2}  {masked}  {kind}: {}", outcome.reason)?;
            }
        }
    }
    Ok(())
}

async fn read_key_from_stdin() -> anyhow::Result<String> {
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read key from stdin")?;
    Ok(line)
}

fn write_key_table(out: &mut impl Write, keys: &[KeySnapshot]) -> anyhow::Result<()> {
    if keys.is_empty() {
        writeln!(out, "no keys configured")?;
        return Ok(());
    }
    for key in keys {
        let marker = if key.is_current { '*' } else { ' ' };
        write!(
            out,
            "{marker} {:>2}  {}  {:<8}  {:>6} ok  {:>6} failed",
            key.index,
            key.masked,
            key.status.label(),
            key.stats.successful_requests,
            key.stats.failed_requests
        )?;
        if let Some(secs) = key.cooldown_remaining_secs {
            write!(out, "  cooldown {}", format_remaining(secs))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// `23h 5m`, `4m 10s` or `9s`.
fn format_remaining(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing;
    use keystore::{Codec, KeyStatus, KeyStore};

    const GOOD: &str = "AIzaSyGoodKey0001567890abcdefghijklm";
    const GOOD_2: &str = "AIzaSyGoodKey0002567890abcdefghijklm";
    const BAD: &str = "AIzaSyBadKey00014567890abcdefghijklm";

    struct Fixture {
        app: App,
        dir: tempfile::TempDir,
    }

    async fn fixture(probe_url: Option<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        if let Some(url) = probe_url {
            config.probe.url = url;
        }
        let store = KeyStore::new(dir.path(), Codec::derive(b"keypoolctl-tests", 1_000));
        let (pool, _) = Pool::open(config.pool.clone(), store).await;
        let app = App::new(Arc::new(pool), &config, CancellationToken::new()).unwrap();
        Fixture { app, dir }
    }

    async fn exec(app: &App, command: Command) -> anyhow::Result<String> {
        let mut out = Vec::new();
        run(app, command, &mut out).await?;
        Ok(String::from_utf8(out).unwrap())
    }

    async fn add(app: &App, key: &str) {
        exec(app, Command::Add { key: Some(key.into()) }).await.unwrap();
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["keypoolctl", "--config", "/etc/k.toml", "reset-cooldown", "2"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/k.toml")));
        assert!(matches!(cli.command, Command::ResetCooldown { index: 2 }));

        let cli = Cli::try_parse_from(["keypoolctl", "probe", "--all"]).unwrap();
        assert!(matches!(cli.command, Command::Probe { all: true, metrics: false }));

        assert!(Cli::try_parse_from(["keypoolctl", "remove"]).is_err());
    }

    #[tokio::test]
    async fn add_list_remove_never_print_secrets() {
        let f = fixture(None).await;
        let added = exec(&f.app, Command::Add { key: Some(GOOD.into()) }).await.unwrap();
        assert_eq!(added, "added AIza...jklm at index 0\n");
        add(&f.app, GOOD_2).await;

        let listing = exec(&f.app, Command::List { json: false }).await.unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("*  0  AIza...jklm  active"), "{listing}");
        assert!(!listing.contains(GOOD) && !listing.contains(GOOD_2));

        let removed = exec(&f.app, Command::Remove { index: 0 }).await.unwrap();
        assert!(removed.contains("was index 0"));
        assert_eq!(f.app.pool.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_and_duplicate_keys_fail() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        let err = exec(&f.app, Command::Add { key: Some(GOOD.into()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already configured"), "{err}");
        assert!(exec(&f.app, Command::Add { key: Some("short".into()) }).await.is_err());
    }

    #[tokio::test]
    async fn stats_json_is_machine_readable() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        add(&f.app, GOOD_2).await;
        exec(&f.app, Command::Disable { index: 1 }).await.unwrap();

        let json = exec(&f.app, Command::Stats { json: true }).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["total_keys"], 2);
        assert_eq!(value["disabled_keys"], 1);
        assert_eq!(value["keys"][1]["status"], "disabled");
        assert!(!json.contains(GOOD));

        let text = exec(&f.app, Command::Stats { json: false }).await.unwrap();
        assert!(text.starts_with("keys:       2 (1 active, 0 cooldown, 1 disabled)"), "{text}");
    }

    #[tokio::test]
    async fn use_and_reset_commands() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        add(&f.app, GOOD_2).await;

        exec(&f.app, Command::Use { index: 1 }).await.unwrap();
        assert_eq!(f.app.pool.current().await.unwrap().index, 1);

        exec(&f.app, Command::Disable { index: 1 }).await.unwrap();
        let out = exec(&f.app, Command::ResetCooldown { index: 1 }).await.unwrap();
        assert!(out.contains("active again"));
        assert_eq!(f.app.pool.snapshots().await[1].status, KeyStatus::Active);

        let err = exec(&f.app, Command::Use { index: 5 }).await.unwrap_err();
        assert!(err.to_string().contains("no key at index 5"), "{err}");
    }

    #[tokio::test]
    async fn clear_requires_confirmation() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        let err = exec(&f.app, Command::Clear { yes: false }).await.unwrap_err();
        assert!(err.to_string().contains("--yes"));
        assert_eq!(f.app.pool.len().await, 1);

        let out = exec(&f.app, Command::Clear { yes: true }).await.unwrap();
        assert_eq!(out, "removed 1 keys\n");
        let listing = exec(&f.app, Command::List { json: false }).await.unwrap();
        assert_eq!(listing, "no keys configured\n");
    }

    #[tokio::test]
    async fn import_reads_legacy_file() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        let legacy = f.dir.path().join("config.json");
        let json = serde_json::json!({
            "gemini_api_key": GOOD,
            "api": {"keys": [GOOD_2, {"key": "nope"}]}
        });
        std::fs::write(&legacy, json.to_string()).unwrap();

        let out = exec(&f.app, Command::Import { path: legacy }).await.unwrap();
        assert_eq!(
            out,
            "imported 1 of 3 keys (1 duplicate, 1 invalid, 0 over capacity)\n"
        );

        let missing = exec(
            &f.app,
            Command::Import {
                path: PathBuf::from("/nonexistent/config.json"),
            },
        )
        .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters() {
        let f = fixture(None).await;
        add(&f.app, GOOD).await;
        let id = f.app.pool.current().await.unwrap().id;
        f.app.pool.mark_success(&id, Usage::translation(3)).await;

        exec(&f.app, Command::ResetStats).await.unwrap();
        assert_eq!(f.app.pool.summary_stats().await.translations, 0);
    }

    #[tokio::test]
    async fn pooled_probe_rotates_past_rate_limited_key() {
        let url = testing::spawn_upstream().await;
        let f = fixture(Some(url)).await;
        add(&f.app, BAD).await;
        add(&f.app, GOOD).await;

        let out = exec(&f.app, Command::Probe { all: false, metrics: false })
            .await
            .unwrap();
        assert_eq!(out, "ok: AIza...jklm answered HTTP 200 after 2 attempt(s)\n");

        let summary = f.app.pool.summary_stats().await;
        assert_eq!(summary.keys[0].status, KeyStatus::Cooldown);
        assert_eq!(summary.keys[1].stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn pooled_probe_with_only_bad_keys_is_exhausted() {
        let url = testing::spawn_upstream().await;
        let f = fixture(Some(url)).await;
        add(&f.app, BAD).await;

        let err = exec(&f.app, Command::Probe { all: false, metrics: false })
            .await
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("currently unavailable"), "{chain}");
    }

    #[tokio::test]
    async fn probe_all_reports_each_key() {
        let url = testing::spawn_upstream().await;
        let f = fixture(Some(url)).await;
        add(&f.app, GOOD).await;
        add(&f.app, BAD).await;

        let out = exec(&f.app, Command::Probe { all: true, metrics: false })
            .await
            .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2, "{out}");
        assert!(lines[0].ends_with("ok (HTTP 200)"), "{out}");
        assert!(lines[1].contains("rate_limited: HTTP 429"), "{out}");
        assert!(!out.contains(BAD));

        let summary = f.app.pool.summary_stats().await;
        assert_eq!(summary.keys[1].status, KeyStatus::Cooldown);
    }

    #[tokio::test]
    async fn cancelled_probe_stops() {
        let url = testing::spawn_upstream().await;
        let f = fixture(Some(url)).await;
        add(&f.app, GOOD).await;
        f.app.cancel.cancel();

        let err = exec(&f.app, Command::Probe { all: false, metrics: false })
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("cancelled"), "{err:#}");
        let err = exec(&f.app, Command::Probe { all: true, metrics: false })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err}");
    }

    #[test]
    fn remaining_time_formats() {
        assert_eq!(format_remaining(9), "9s");
        assert_eq!(format_remaining(250), "4m 10s");
        assert_eq!(format_remaining(23 * 3600 + 300), "23h 5m");
    }
}
