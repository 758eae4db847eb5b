//! Inbound request model and host extraction

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HOST, USER_AGENT};
use hyper::{Method, Uri};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

const INDEX_PAGES: &[&str] = &[
    "/index.php",
    "/index.asp",
    "/index.jsp",
    "/index.htm",
    "/index.html",
    "/index.shtml",
];

/// A fully buffered inbound request, detached from the connection
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Effective request host, lowercase and without port
    pub host: String,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes, host: String) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            host,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    pub fn user_agent(&self) -> &str {
        self.headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_index(&self) -> bool {
        is_index_page(self.path())
    }
}

/// Extract the effective request host: URI authority first (HTTP/2), then Host header.
///
/// The port is stripped and the result lowercased. Returns `None` for missing or
/// malformed hosts.
pub fn resolve_host(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let raw = match uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => headers.get(HOST)?.to_str().ok()?.to_string(),
    };
    let raw = raw.rsplit('@').next().unwrap_or(&raw).trim();

    let hostname = if let Some(rest) = raw.strip_prefix('[') {
        let inner = rest.split(']').next()?;
        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return None;
        }
        inner
    } else {
        raw.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // alphanumeric, hyphen, underscore, dot and (for IPv6) colon only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == ':')
    {
        return None;
    }

    Some(hostname.trim_end_matches('.').to_ascii_lowercase())
}

/// Whether a request path addresses a site's index page
pub fn is_index_page(path: &str) -> bool {
    if path.is_empty() || path == "/" {
        return true;
    }
    INDEX_PAGES.iter().any(|p| p.eq_ignore_ascii_case(path))
}
