//! Backend discovery.
//!
//! Every connection attempt asks the directory service where the backend
//! currently lives. The answer is used for that attempt only and is never
//! cached, since the backend may move between connections.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::ResolveError;

/// Default deadline for a directory lookup.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on hostname length (RFC 1035).
const MAX_HOST_LEN: usize = 253;

/// Largest directory body read before the answer is rejected.
const MAX_BODY_LEN: usize = 512;

/// Resolved backend endpoint for a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    /// Hostname or IP literal (IPv6 without brackets).
    pub host: String,
    /// Target port.
    pub port: u16,
}

impl BackendAddr {
    /// Create a backend address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Source of backend addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Look up the backend for one connection attempt.
    async fn resolve(&self) -> Result<BackendAddr, ResolveError>;
}

/// Resolver that asks an HTTP directory service.
///
/// A `200` response whose trimmed body names a host yields `host:target_port`.
/// Anything else is a failure; there is no retry.
pub struct HttpResolver {
    client: reqwest::Client,
    url: String,
    target_port: u16,
    timeout: Option<Duration>,
}

impl HttpResolver {
    /// Create a resolver for `url`, pairing answers with `target_port`.
    pub fn new(
        url: impl Into<String>,
        target_port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("piper/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            target_port,
            timeout,
        })
    }

    async fn fetch(&self) -> Result<BackendAddr, ResolveError> {
        let resp = self.client.get(&self.url).send().await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(ResolveError::Status(status.as_u16()));
        }

        let body = read_body(resp).await?;
        debug!(url = %self.url, body_len = body.len(), "directory answered");

        parse_backend_host(&body, self.target_port)
    }
}

async fn read_body(mut resp: reqwest::Response) -> Result<String, ResolveError> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > MAX_BODY_LEN {
            return Err(ResolveError::MalformedBody(format!(
                "body exceeds {MAX_BODY_LEN} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    String::from_utf8(body)
        .map_err(|_| ResolveError::MalformedBody("body is not UTF-8".to_string()))
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self) -> Result<BackendAddr, ResolveError> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(ResolveError::Timeout),
            },
            None => self.fetch().await,
        }
    }
}

/// Resolver that always returns the same address.
///
/// Useful for pinning a backend in development and in tests.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addr: BackendAddr,
}

impl StaticResolver {
    pub fn new(addr: BackendAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self) -> Result<BackendAddr, ResolveError> {
        Ok(self.addr.clone())
    }
}

/// Turn a directory response body into a backend address.
///
/// Accepts an IPv4 literal, an IPv6 literal (optionally bracketed) or a DNS
/// hostname. Surrounding whitespace is ignored.
pub fn parse_backend_host(body: &str, port: u16) -> Result<BackendAddr, ResolveError> {
    let host = body.trim();
    if host.is_empty() {
        return Err(ResolveError::EmptyBody);
    }

    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(BackendAddr::new(ip.to_string(), port));
    }

    if is_valid_hostname(host) {
        return Ok(BackendAddr::new(host.to_ascii_lowercase(), port));
    }

    Err(ResolveError::MalformedBody(truncate(host, 64)))
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }

    // An all-numeric top label is a mangled IP literal, not a name (RFC 1123 2.1).
    let top = host.rsplit('.').next().unwrap_or(host);
    if top.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
