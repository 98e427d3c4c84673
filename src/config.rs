//! Run configuration

use crate::fetch::client::RequestTemplate;
use crate::fetch::retry::RetryPolicy;
use crate::orchestrator::OrchestratorConfig;
use crate::proxy::validator::ValidatorConfig;
use crate::Result;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Every tunable of a run, loadable from a JSON file.
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fetch workers running at once
    pub concurrency: usize,
    /// Attempts per task
    pub max_retries: u32,
    /// Exponential backoff base
    pub backoff_base: f64,
    /// Unit the backoff is measured in, milliseconds
    pub backoff_unit_ms: u64,
    /// Per-request timeout, seconds
    pub request_timeout_secs: u64,
    /// Probe URL for validating proxies
    pub probe_url: String,
    /// Probe timeout, seconds
    pub probe_timeout_secs: u64,
    /// Concurrent probes during a refresh
    pub validation_workers: usize,
    /// Seconds between pool refreshes
    pub refresh_interval_secs: u64,
    /// Seconds to wait for the first usable pool
    pub startup_timeout_secs: u64,
    /// Courtesy delay range after each completion, milliseconds
    pub courtesy_delay_ms: (u64, u64),
    /// Base directory for run output
    pub output_dir: PathBuf,
    /// Task field holding the location key
    pub key_field: String,
    /// Listing API URL template, `{param}` filled from task fields
    pub url_template: String,
    /// Extra request headers, values may use `{param}`
    pub headers: BTreeMap<String, String>,
    /// User agents rotated per request; empty keeps the built-in list
    pub user_agents: Vec<String>,
    /// Proxy list files used instead of the built-in remote sources
    pub proxy_files: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit_ms: 1_000,
            request_timeout_secs: 30,
            probe_url: "https://httpbin.org/get".to_string(),
            probe_timeout_secs: 10,
            validation_workers: 50,
            refresh_interval_secs: 3_600,
            startup_timeout_secs: 120,
            courtesy_delay_ms: (1_000, 3_000),
            output_dir: PathBuf::from("data"),
            key_field: crate::task::DEFAULT_KEY_FIELD.to_string(),
            url_template: String::new(),
            headers: BTreeMap::new(),
            user_agents: Vec::new(),
            proxy_files: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_url_template(mut self, url: impl Into<String>) -> Self {
        self.url_template = url.into();
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base)
            .with_backoff_unit(Duration::from_millis(self.backoff_unit_ms))
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig::new()
            .with_timeout(Duration::from_secs(self.probe_timeout_secs))
            .with_workers(self.validation_workers)
            .with_probe_url(self.probe_url.clone())
    }

    pub fn request_template(&self) -> RequestTemplate {
        let mut template = RequestTemplate::new(self.url_template.clone());
        for (name, value) in &self.headers {
            template = template.with_header(name.clone(), value.clone());
        }
        if !self.user_agents.is_empty() {
            template = template.with_user_agents(self.user_agents.clone());
        }
        template
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let (low, high) = self.courtesy_delay_ms;
        OrchestratorConfig {
            concurrency: self.concurrency.max(1),
            retry: self.retry_policy(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            courtesy_delay: Duration::from_millis(low.min(high))..=Duration::from_millis(high.max(low)),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
