//! Parsing proxy candidates from text lists

use crate::proxy::models::{ProxyAuth, ProxyEndpoint, ProxyScheme};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://(?:([^:]+):([^@]+)@)?([^:/]+):(\d+)/?$")
        .expect("Invalid proxy URL regex")
});

static AUTH_AT_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^:]+):([^@]+)@([^:]+):(\d+)$").expect("Invalid user:pass@host regex")
});

/// Parser for proxy list lines
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT:USER:PASS
    /// - USER:PASS@IP:PORT
    /// - scheme://IP:PORT
    /// - scheme://USER:PASS@IP:PORT
    pub fn parse_line(line: &str, default_scheme: ProxyScheme) -> Option<ProxyEndpoint> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        Self::parse_url_format(line)
            .or_else(|| Self::parse_auth_at_format(line, default_scheme))
            .or_else(|| Self::parse_colon_format(line, default_scheme))
    }

    fn parse_url_format(line: &str) -> Option<ProxyEndpoint> {
        let caps = URL_FORMAT.captures(line)?;
        let scheme = ProxyScheme::parse(&caps[1])?;
        let port = parse_port(&caps[5])?;
        let endpoint = ProxyEndpoint::new(&caps[4], port, scheme);

        match (caps.get(2), caps.get(3)) {
            (Some(user), Some(pass)) => {
                Some(endpoint.with_auth(ProxyAuth::new(user.as_str(), pass.as_str())))
            }
            _ => Some(endpoint),
        }
    }

    fn parse_auth_at_format(line: &str, default_scheme: ProxyScheme) -> Option<ProxyEndpoint> {
        let caps = AUTH_AT_FORMAT.captures(line)?;
        let port = parse_port(&caps[4])?;

        Some(
            ProxyEndpoint::new(&caps[3], port, default_scheme)
                .with_auth(ProxyAuth::new(&caps[1], &caps[2])),
        )
    }

    fn parse_colon_format(line: &str, default_scheme: ProxyScheme) -> Option<ProxyEndpoint> {
        let parts: Vec<&str> = line.split(':').collect();

        match parts.as_slice() {
            [host, port] if !host.is_empty() => {
                Some(ProxyEndpoint::new(*host, parse_port(port)?, default_scheme))
            }
            [host, port, user, pass] if !host.is_empty() => Some(
                ProxyEndpoint::new(*host, parse_port(port)?, default_scheme)
                    .with_auth(ProxyAuth::new(*user, *pass)),
            ),
            _ => None,
        }
    }

    /// Parse every recognisable line of `content`
    pub fn parse_string(content: &str, default_scheme: ProxyScheme) -> Vec<ProxyEndpoint> {
        content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_scheme))
            .collect()
    }

    pub fn parse_file<P: AsRef<Path>>(
        path: P,
        default_scheme: ProxyScheme,
    ) -> Result<Vec<ProxyEndpoint>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content, default_scheme))
    }

    /// Save endpoints one per line
    pub fn save_to_file<P: AsRef<Path>>(proxies: &[ProxyEndpoint], path: P) -> Result<()> {
        let content = proxies
            .iter()
            .map(ProxyEndpoint::to_line)
            .collect::<Vec<_>>()
            .join("\n");

        fs::write(path, content)?;
        Ok(())
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|port| *port != 0)
}
