//! Listing requests routed through a proxy

use crate::error::TransportError;
use crate::proxy::models::ProxyEndpoint;
use crate::proxy::validator::build_client;
use crate::task::LocationTask;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use regex::Regex;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;

/// `{name}` placeholders in URL and header templates
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("Invalid placeholder regex"));

/// Markers of a bot-mitigation interstitial instead of the API answer
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "Just a moment...",
    "Attention Required!",
    "cf-turnstile",
];

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Safari/605.1.15",
];

/// Body of a response the remote API answered with
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    /// Well-formed JSON payload
    Json(serde_json::Value),
    /// Success status but the body is not JSON
    Raw(String),
}

/// Performs one request for `task` through `proxy`, finishing within `timeout`
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch(
        &self,
        task: &LocationTask,
        proxy: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError>;
}

/// Request shape for the listing API
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    /// URL with `{param}` placeholders filled from the task
    pub url: String,
    /// Header values may use the same placeholders
    pub headers: BTreeMap<String, String>,
    /// Rotated per request unless a `User-Agent` header is set
    pub user_agents: Vec<String>,
}

impl RequestTemplate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = user_agents;
        self
    }

    pub fn render_url(&self, task: &LocationTask) -> String {
        render(&self.url, task)
    }

    /// Headers for one request, user agent picked at random
    pub fn render_headers(&self, task: &LocationTask) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), render(value, task)))
            .collect();

        let has_user_agent = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"));
        if !has_user_agent {
            if let Some(ua) = self.user_agents.choose(&mut rand::rng()) {
                headers.push(("User-Agent".to_string(), ua.clone()));
            }
        }
        headers
    }
}

/// Substitute `{name}` with the task parameter; unknown names are left verbatim
fn render(template: &str, task: &LocationTask) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match (&caps[1], task.param(&caps[1])) {
                ("key", None) => task.key().to_string(),
                (_, Some(value)) => value.to_string(),
                (_, None) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// reqwest-backed fetcher that builds one client per proxy and request
#[derive(Debug, Clone)]
pub struct HttpListingFetcher {
    template: RequestTemplate,
}

impl HttpListingFetcher {
    pub fn new(template: RequestTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl ListingFetcher for HttpListingFetcher {
    async fn fetch(
        &self,
        task: &LocationTask,
        proxy: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        let client =
            build_client(proxy, timeout).map_err(|e| TransportError::Client(e.to_string()))?;

        let mut request = client.get(self.template.render_url(task));
        for (name, value) in self.template.render_headers(task) {
            request = request.header(name, value);
        }

        let send = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return Err(TransportError::from_reqwest(e, timeout)),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        classify(status, body)
    }
}

/// Map a received answer onto a payload or a transport failure
pub(crate) fn classify(status: StatusCode, body: String) -> Result<FetchResponse, TransportError> {
    if is_challenge(status, &body) {
        return Err(TransportError::Challenge(status.as_u16()));
    }
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    match serde_json::from_str(&body) {
        Ok(value) => Ok(FetchResponse::Json(value)),
        Err(_) => Ok(FetchResponse::Raw(body)),
    }
}

fn is_challenge(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let challenge_status = matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::SERVICE_UNAVAILABLE
    );
    challenge_status && CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}
