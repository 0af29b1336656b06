//! Prometheus exposition for `probe --metrics`
//!
//! The pool and invoker emit through the `metrics` facade; installing this
//! recorder lets the CLI print what a run produced in text exposition format.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// `keypool_backoff_seconds` gets explicit buckets spanning the default
/// backoff range (2s base, 60s cap) so it renders as a histogram.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("keypool_backoff_seconds".to_string()),
            &[0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0],
        )
        .context("failed to set histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}
