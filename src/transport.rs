//! Outbound transport to upstream origins
//!
//! One pooled HTTP client is kept per egress address and a client is picked at
//! random for every request, spreading connections across the host's public
//! interfaces.

use crate::request::InboundRequest;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, REFERER, USER_AGENT,
};
use hyper::StatusCode;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Headers that only make sense for a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build upstream client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("failed to read upstream body: {0}")]
    Body(#[source] reqwest::Error),
}

/// Statistics for the upstream transport
#[derive(Debug, Default)]
pub struct TransportStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub request_timeout: Duration,
    /// Egress addresses; empty means the unspecified address
    pub source_ips: Vec<IpAddr>,
    /// Replaces the client's User-Agent upstream when set
    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            source_ips: Vec::new(),
            user_agent: None,
        }
    }
}

/// A buffered upstream response
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The URL that was requested upstream
    pub url: Url,
}

pub struct UpstreamTransport {
    clients: Vec<reqwest::Client>,
    user_agent: Option<HeaderValue>,
    stats: Arc<TransportStats>,
}

impl UpstreamTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let addresses: Vec<Option<IpAddr>> = if config.source_ips.is_empty() {
            vec![None]
        } else {
            config.source_ips.iter().copied().map(Some).collect()
        };

        let mut clients = Vec::with_capacity(addresses.len());
        for address in addresses {
            let client = reqwest::Client::builder()
                .local_address(address)
                .connect_timeout(config.connect_timeout)
                .tcp_keepalive(Some(config.keepalive))
                .timeout(config.request_timeout)
                .redirect(reqwest::redirect::Policy::none())
                .no_proxy()
                .build()
                .map_err(TransportError::Build)?;
            clients.push(client);
        }

        let user_agent = config
            .user_agent
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .and_then(|ua| HeaderValue::from_str(ua).ok());

        info!(
            egress = clients.len(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Upstream transport configured"
        );

        Ok(Self {
            clients,
            user_agent,
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    pub fn egress_count(&self) -> usize {
        self.clients.len()
    }

    fn pick(&self) -> &reqwest::Client {
        let index = rand::thread_rng().gen_range(0..self.clients.len());
        &self.clients[index]
    }

    /// Forward the inbound request to `target` and buffer the response.
    ///
    /// Dropping the returned future aborts the upstream exchange.
    pub async fn forward(
        &self,
        target: &Url,
        req: &InboundRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = upstream_url(target, req.path(), req.query());
        let headers = upstream_headers(&req.headers, target, self.user_agent.as_ref());
        self.stats.record_request();
        debug!(url = %url, method = %req.method, "Forwarding upstream");

        let mut builder = self.pick().request(req.method.clone(), url.clone()).headers(headers);
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            self.stats.record_failure();
            warn!(url = %url, error = %e, "Upstream request failed");
            TransportError::Request(e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            self.stats.record_failure();
            warn!(url = %url, error = %e, "Failed to read upstream body");
            TransportError::Body(e)
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

/// Join two URL paths with exactly one slash between them
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Target URL for an inbound path and query: paths are joined, queries merged
/// as `base&incoming`.
pub fn upstream_url(target: &Url, path: &str, query: &str) -> Url {
    let mut url = target.clone();
    url.set_path(&single_joining_slash(target.path(), path));

    let base = target.query().unwrap_or("");
    let merged = if base.is_empty() || query.is_empty() {
        format!("{}{}", base, query)
    } else {
        format!("{}&{}", base, query)
    };
    url.set_query(if merged.is_empty() { None } else { Some(&merged) });
    url.set_fragment(None);
    url
}

/// `host[:port]` of a URL
pub fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// Headers sent upstream.
///
/// Hop-by-hop and conditional headers are dropped, Referer points at the
/// upstream origin, only gzip is accepted, and a missing User-Agent is sent
/// empty rather than left to the client library.
pub fn upstream_headers(
    incoming: &HeaderMap,
    target: &Url,
    user_agent: Option<&HeaderValue>,
) -> HeaderMap {
    let connection_listed: Vec<String> = incoming
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    let mut headers = HeaderMap::with_capacity(incoming.len() + 3);
    for (name, value) in incoming {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || connection_listed.iter().any(|c| c == lower)
            || name == HOST
            || name == CONTENT_LENGTH
            || name == IF_MODIFIED_SINCE
            || name == IF_NONE_MATCH
            || name == ACCEPT_ENCODING
            || name == REFERER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let referer = format!("{}://{}", target.scheme(), authority(target));
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(REFERER, value);
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

    match user_agent {
        Some(ua) => {
            headers.insert(USER_AGENT, ua.clone());
        }
        None => {
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, HeaderValue::from_static(""));
            }
        }
    }
    headers
}

/// Drop hop-by-hop headers from an upstream response
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|v| HeaderName::from_bytes(v.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified())
}

/// Public IPv4 addresses of the local interfaces
pub fn public_source_ips() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) if is_public_ipv4(ip) => Some(IpAddr::V4(ip)),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate interfaces, using the default route");
            Vec::new()
        }
    }
}
