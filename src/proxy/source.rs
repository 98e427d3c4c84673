//! External sources of candidate proxies
//!
//! This module provides:
//! - The [`ProxySource`] trait the refresher gathers candidates through
//! - A plain-text list source (one `ip:port` per line, ProxyScrape style)
//! - An HTML page source that scrapes `ip:port` pairs out of tables or text
//! - A local file source

use crate::proxy::models::{ProxyEndpoint, ProxyScheme};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for source requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// User agent sent to proxy list sites
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

/// `ip:port` anywhere in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// `<tr>` rows of an HTML table
static TABLE_ROW_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("Invalid table row regex"));

/// `<td>` cell contents
static TABLE_CELL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").expect("Invalid table cell regex"));

/// Column of free-proxy-list style tables saying whether HTTPS is supported
const HTTPS_COLUMN: usize = 6;

/// Something that can list candidate proxies. May return an empty list.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn list_candidates(&self) -> Result<Vec<ProxyEndpoint>>;
}

/// How a remote source formats its list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// One proxy per line
    PlainText,
    /// HTML page; `ip | port | ...` table rows, or free text when there is no table.
    /// Rows with an HTTPS column keep only proxies marked `yes`.
    Html,
}

/// A proxy list served over HTTP
#[derive(Debug, Clone)]
pub struct HttpSource {
    name: String,
    url: String,
    format: SourceFormat,
    scheme: ProxyScheme,
    client: Client,
}

impl HttpSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        format: SourceFormat,
        scheme: ProxyScheme,
    ) -> Result<Self> {
        Self::with_timeout(
            name,
            url,
            format,
            scheme,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        name: impl Into<String>,
        url: impl Into<String>,
        format: SourceFormat,
        scheme: ProxyScheme,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            format,
            scheme,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The sources used when none are configured
    pub fn common(timeout: Duration) -> Result<Vec<Self>> {
        Ok(vec![
            Self::with_timeout(
                "proxyscrape",
                "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=https&timeout=10000&country=all&ssl=yes&anonymity=all",
                SourceFormat::PlainText,
                ProxyScheme::Http,
                timeout,
            )?,
            Self::with_timeout(
                "free-proxy-list.net",
                "https://free-proxy-list.net/",
                SourceFormat::Html,
                ProxyScheme::Http,
                timeout,
            )?,
        ])
    }
}

#[async_trait]
impl ProxySource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_candidates(&self) -> Result<Vec<ProxyEndpoint>> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let content = response.text().await?;

        let proxies = match self.format {
            SourceFormat::PlainText => parse_plain_text(&content, self.scheme),
            SourceFormat::Html => parse_html(&content, self.scheme),
        };
        Ok(proxies)
    }
}

/// A proxy list kept in a local file
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    scheme: ProxyScheme,
    name: String,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, scheme: ProxyScheme) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, scheme, name }
    }
}

#[async_trait]
impl ProxySource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_candidates(&self) -> Result<Vec<ProxyEndpoint>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(ProxyParser::parse_string(&content, self.scheme))
    }
}

/// Outcome of gathering from one source
#[derive(Debug, Clone)]
pub struct GatherResult {
    pub source: String,
    pub proxies: Vec<ProxyEndpoint>,
    pub error: Option<String>,
}

impl GatherResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Query every source concurrently. A failing source yields an error entry
/// and no candidates; it never fails the whole gather.
pub async fn gather_from(sources: &[Arc<dyn ProxySource>]) -> Vec<GatherResult> {
    let lookups = sources.iter().map(|source| async move {
        match source.list_candidates().await {
            Ok(proxies) => {
                info!(source = source.name(), count = proxies.len(), "fetched candidates");
                GatherResult {
                    source: source.name().to_string(),
                    proxies,
                    error: None,
                }
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "proxy source failed");
                GatherResult {
                    source: source.name().to_string(),
                    proxies: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    });

    futures::future::join_all(lookups).await
}

/// Merge gather results into one list, first occurrence of each address wins
pub fn merge_candidates(results: Vec<GatherResult>) -> Vec<ProxyEndpoint> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .flat_map(|result| result.proxies)
        .filter(|proxy| seen.insert(proxy.address()))
        .collect()
}

/// Gather and merge candidates from every source
pub async fn list_candidates(sources: &[Arc<dyn ProxySource>]) -> Vec<ProxyEndpoint> {
    merge_candidates(gather_from(sources).await)
}

fn parse_plain_text(content: &str, scheme: ProxyScheme) -> Vec<ProxyEndpoint> {
    let proxies = ProxyParser::parse_string(content, scheme);
    if proxies.is_empty() {
        extract_ip_ports(content, scheme)
    } else {
        proxies
    }
}

fn parse_html(content: &str, scheme: ProxyScheme) -> Vec<ProxyEndpoint> {
    let mut proxies: Vec<ProxyEndpoint> = TABLE_ROW_REGEX
        .captures_iter(content)
        .filter_map(|row| endpoint_from_row(row.get(1)?.as_str(), scheme))
        .collect();
    if proxies.is_empty() {
        proxies = extract_ip_ports(content, scheme);
    }

    let mut seen = HashSet::new();
    proxies.retain(|proxy| seen.insert(proxy.address()));
    proxies
}

fn endpoint_from_row(row: &str, scheme: ProxyScheme) -> Option<ProxyEndpoint> {
    let cells: Vec<&str> = TABLE_CELL_REGEX
        .captures_iter(row)
        .filter_map(|cell| cell.get(1))
        .map(|cell| cell.as_str().trim())
        .collect();
    if let Some(https) = cells.get(HTTPS_COLUMN) {
        if !https.eq_ignore_ascii_case("yes") {
            return None;
        }
    }
    endpoint_from_parts(cells.first()?, cells.get(1)?, scheme)
}

fn extract_ip_ports(content: &str, scheme: ProxyScheme) -> Vec<ProxyEndpoint> {
    IP_PORT_REGEX
        .captures_iter(content)
        .filter_map(|cap| endpoint_from_parts(&cap[1], &cap[2], scheme))
        .collect()
}

fn endpoint_from_parts(host: &str, port: &str, scheme: ProxyScheme) -> Option<ProxyEndpoint> {
    host.parse::<Ipv4Addr>().ok()?;
    let port: u16 = port.parse().ok().filter(|port| *port != 0)?;
    Some(ProxyEndpoint::new(host, port, scheme))
}
