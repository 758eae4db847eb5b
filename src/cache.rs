//! Content-addressed, file-backed response cache
//!
//! Records live at `<root>/<domain>/<hash[..5]>/<hash>` where `hash` is the
//! hex SHA-1 of domain, path and query. Freshness comes from the file mtime;
//! expired records are shadowed rather than deleted so a forced read can still
//! serve them while the upstream is failing.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const SHARD_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encode error: {0}")]
    Encode(#[from] postcard::Error),
    #[error("refusing to cache under domain '{0}'")]
    InvalidDomain(String),
}

/// A stored response: status, headers, canonical body and the decoy snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub random_html: String,
}

impl CachedResponse {
    /// Status to serve; an unset status is treated as 200
    pub fn status(&self) -> u16 {
        if self.status == 0 {
            200
        } else {
            self.status
        }
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .unwrap_or("")
    }
}

/// Hex SHA-1 over domain + path + query
pub fn cache_key(domain: &str, path: &str, query: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rewrite any charset parameter of a Content-Type value to utf-8
pub fn normalize_content_type(value: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut had_charset = false;
    for (i, part) in value.split(';').enumerate() {
        let trimmed = part.trim();
        if i > 0 && trimmed.to_ascii_lowercase().starts_with("charset=") {
            parts.push("charset=utf-8".to_string());
            had_charset = true;
        } else if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    if !had_charset && value.trim_start().to_ascii_lowercase().starts_with("text/") {
        parts.push("charset=utf-8".to_string());
    }
    parts.join("; ")
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, domain: &str, key: &str) -> PathBuf {
        let shard = &key[..SHARD_LEN.min(key.len())];
        self.root.join(domain).join(shard).join(key)
    }

    /// Persist a response record. The write goes to a temp file in the shard
    /// directory and is renamed into place, so readers never see a torn record.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        domain: &str,
        path: &str,
        query: &str,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
        random_html: &str,
    ) -> Result<PathBuf, CacheError> {
        check_domain(domain)?;
        let key = cache_key(domain, path, query);
        let target = self.path_for(domain, &key);

        let mut stored_headers = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            if name == CONTENT_ENCODING || name == CONTENT_LENGTH {
                continue;
            }
            if name == CONTENT_TYPE {
                let normalized = normalize_content_type(value.to_str().unwrap_or_default());
                stored_headers.push((name.as_str().to_string(), normalized.into_bytes()));
            } else {
                stored_headers.push((name.as_str().to_string(), value.as_bytes().to_vec()));
            }
        }

        let record = CachedResponse {
            status,
            headers: stored_headers,
            body: body.to_vec(),
            random_html: random_html.to_string(),
        };
        let encoded = postcard::to_allocvec(&record)?;

        let dir = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&encoded)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| CacheError::Io(e.error))?;

        debug!(domain, path, key, bytes = encoded.len(), "Cached response");
        Ok(target)
    }

    /// Look up a record. Expired records are a miss unless `force` is set.
    pub fn lookup(
        &self,
        domain: &str,
        path: &str,
        query: &str,
        ttl: Duration,
        force: bool,
    ) -> Option<CachedResponse> {
        self.lookup_at(domain, path, query, ttl, force, SystemTime::now())
    }

    pub fn lookup_at(
        &self,
        domain: &str,
        path: &str,
        query: &str,
        ttl: Duration,
        force: bool,
        now: SystemTime,
    ) -> Option<CachedResponse> {
        check_domain(domain).ok()?;
        let key = cache_key(domain, path, query);
        let file = self.path_for(domain, &key);

        let metadata = std::fs::metadata(&file).ok()?;
        if !force {
            let modified = metadata.modified().ok()?;
            // An expiry past the representable range never comes
            let expired = modified.checked_add(ttl).is_some_and(|expires| now > expires);
            if expired {
                debug!(domain, path, key, "Cache entry expired");
                return None;
            }
        }

        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Failed to read cache entry");
                return None;
            }
        };
        match postcard::from_bytes::<CachedResponse>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Remove every cached record of a domain and of the subdomains it serves
    pub fn purge_domain(&self, domain: &str) -> Result<(), CacheError> {
        check_domain(domain)?;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{domain}");
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == domain || name.ends_with(&suffix) {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => debug!(host = name, "Purged cache directory"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Remove every cached record of every domain
    pub fn purge_all(&self) -> Result<(), CacheError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Domains become directory names, so path separators and dot segments are refused
fn check_domain(domain: &str) -> Result<(), CacheError> {
    if domain.is_empty()
        || domain == "."
        || domain == ".."
        || domain.contains('/')
        || domain.contains('\\')
    {
        return Err(CacheError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}
