//! Reachability probe for candidate proxies

use crate::proxy::models::ProxyEndpoint;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Proxy as ReqwestProxy};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default timeout for a probe request in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of concurrent probes
const DEFAULT_WORKERS: usize = 50;

/// Default URL probed through each proxy
const DEFAULT_PROBE_URL: &str = "https://httpbin.org/get";

/// Configuration for the proxy validator
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of probes in flight at once
    pub workers: usize,
    /// URL requested through each proxy
    pub probe_url: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: DEFAULT_WORKERS,
            probe_url: DEFAULT_PROBE_URL.to_string(),
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }
}

/// Checks candidate proxies by requesting the probe URL through them
#[derive(Debug, Clone, Default)]
pub struct ProxyValidator {
    config: ValidatorConfig,
}

impl ProxyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// True iff the probe answered with a success status within the timeout.
    /// Any error is reported as `false`; validation never fails the caller.
    pub async fn validate(&self, proxy: &ProxyEndpoint) -> bool {
        let start = Instant::now();

        let client = match build_client(proxy, self.config.timeout) {
            Ok(client) => client,
            Err(e) => {
                debug!(proxy = %proxy, error = %e, "proxy rejected: client build failed");
                return false;
            }
        };

        match tokio::time::timeout(
            self.config.timeout,
            client.get(&self.config.probe_url).send(),
        )
        .await
        {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!(
                    proxy = %proxy,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "proxy is valid"
                );
                true
            }
            Ok(Ok(response)) => {
                debug!(proxy = %proxy, status = %response.status(), "proxy is invalid");
                false
            }
            Ok(Err(e)) => {
                debug!(proxy = %proxy, error = %e, "proxy is invalid");
                false
            }
            Err(_) => {
                debug!(proxy = %proxy, "proxy probe timed out");
                false
            }
        }
    }

    /// Validate all candidates with at most `workers` probes in flight.
    /// Returns the candidates that passed, in completion order.
    pub async fn validate_all(&self, candidates: Vec<ProxyEndpoint>) -> Vec<ProxyEndpoint> {
        let total = candidates.len();

        let valid: Vec<ProxyEndpoint> = stream::iter(candidates)
            .map(|proxy| async move {
                let ok = self.validate(&proxy).await;
                (proxy, ok)
            })
            .buffer_unordered(self.config.workers.max(1))
            .filter_map(|(proxy, ok)| async move { ok.then_some(proxy) })
            .collect()
            .await;

        info!(valid = valid.len(), total, "validated proxy candidates");
        valid
    }
}

/// Build a client that routes every request through `proxy`
pub(crate) fn build_client(proxy: &ProxyEndpoint, timeout: Duration) -> reqwest::Result<Client> {
    // Plain HTTP proxies also tunnel HTTPS targets via CONNECT.
    let reqwest_proxy = ReqwestProxy::all(proxy.url())?;

    Client::builder()
        .proxy(reqwest_proxy)
        .timeout(timeout)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProxyScheme;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Stub HTTP proxy answering every request with `status_line`
    async fn stub_proxy(status_line: &'static str) -> ProxyEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        ProxyEndpoint::new("127.0.0.1", port, ProxyScheme::Http)
    }

    /// An address nothing listens on
    async fn closed_port() -> ProxyEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        ProxyEndpoint::new("127.0.0.1", port, ProxyScheme::Http)
    }

    fn local_validator() -> ProxyValidator {
        ProxyValidator::with_config(
            ValidatorConfig::new()
                .with_timeout(Duration::from_secs(2))
                .with_probe_url("http://probe.test/get"),
        )
    }

    #[test]
    fn test_validator_config_default() {
        let config = ValidatorConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.probe_url, DEFAULT_PROBE_URL);
    }

    #[test]
    fn test_validator_config_builder() {
        let config = ValidatorConfig::new()
            .with_timeout(Duration::from_secs(3))
            .with_workers(0)
            .with_probe_url("http://example.com");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.workers, 1);
        assert_eq!(config.probe_url, "http://example.com");
    }

    #[tokio::test]
    async fn test_validate_accepts_success_status() {
        let proxy = stub_proxy("200 OK").await;
        assert!(local_validator().validate(&proxy).await);
    }

    #[tokio::test]
    async fn test_validate_rejects_error_status() {
        let proxy = stub_proxy("407 Proxy Authentication Required").await;
        assert!(!local_validator().validate(&proxy).await);
    }

    #[tokio::test]
    async fn test_validate_rejects_unreachable_proxy() {
        let proxy = closed_port().await;
        assert!(!local_validator().validate(&proxy).await);
    }

    #[tokio::test]
    async fn test_validate_all_keeps_only_valid() {
        let good = stub_proxy("200 OK").await;
        let bad = stub_proxy("502 Bad Gateway").await;
        let dead = closed_port().await;

        let valid = local_validator()
            .validate_all(vec![good.clone(), bad, dead])
            .await;
        assert_eq!(valid, vec![good]);
    }
}
