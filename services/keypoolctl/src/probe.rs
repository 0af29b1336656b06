//! Authenticated health check against the upstream API
//!
//! Sends one cheap GET with the key in a header. Any 2xx counts as healthy;
//! everything else becomes a [`Failure`] carrying the status and body so the
//! pool classifier can decide between rate limit, bad key and outage.

use std::time::Duration;

use anyhow::Context;
use common::Secret;
use keypool::Failure;

use crate::config::ProbeConfig;

/// Longest response body kept in a failure message.
const MAX_BODY_CHARS: usize = 512;

pub struct Prober {
    client: reqwest::Client,
    url: String,
    header: String,
}

impl Prober {
    pub fn new(config: &ProbeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            header: config.header.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Probe with `secret`, returning the HTTP status on success.
    pub async fn check(&self, secret: Secret<String>) -> Result<u16, Failure> {
        let response = self
            .client
            .get(&self.url)
            .header(self.header.as_str(), secret.expose_str())
            .send()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();
        Err(Failure::http(status.as_u16(), body))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use keypool::{Classifier, ErrorKind};

    fn prober(url: String) -> Prober {
        Prober::new(&ProbeConfig {
            url,
            timeout_secs: 5,
            ..ProbeConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn healthy_key_returns_status() {
        let url = testing::spawn_upstream().await;
        let status = prober(url)
            .check(Secret::new("AIzaSyGoodKey".to_string()))
            .await
            .unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn rate_limited_key_classifies_as_rate_limited() {
        let url = testing::spawn_upstream().await;
        let failure = prober(url)
            .check(Secret::new("AIzaSyBadKey".to_string()))
            .await
            .unwrap_err();
        assert_eq!(failure.status, Some(429));
        assert!(failure.message.contains("RESOURCE_EXHAUSTED"));
        assert_eq!(Classifier::default().classify(&failure), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn rejected_key_classifies_as_invalid() {
        let url = testing::spawn_upstream().await;
        let failure = prober(url)
            .check(Secret::new("AIzaSyRevokedKey".to_string()))
            .await
            .unwrap_err();
        assert_eq!(failure.status, Some(400));
        assert_eq!(Classifier::default().classify(&failure), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_network_failure() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let failure = prober(format!("http://{addr}/models"))
            .check(Secret::new("AIzaSyGoodKey".to_string()))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, Some(ErrorKind::Network));
    }
}
