//! Concurrent domain to site registry

use crate::error::SiteError;
use crate::site::Site;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps a configured domain to its compiled site.
///
/// Readers clone the `Arc<Site>` out of the map, so a swap never invalidates a
/// site that an in-flight request already holds.
#[derive(Default)]
pub struct SiteRegistry {
    sites: DashMap<String, Arc<Site>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<Arc<Site>> {
        self.sites.get(domain).map(|entry| Arc::clone(entry.value()))
    }

    pub fn put(&self, site: Arc<Site>) {
        let domain = site.domain().to_string();
        debug!(domain, "Registering site");
        self.sites.insert(domain, site);
    }

    /// Replace the site for its domain, returning the previous instance
    pub fn swap(&self, site: Arc<Site>) -> Option<Arc<Site>> {
        let domain = site.domain().to_string();
        debug!(domain, "Swapping site");
        self.sites.insert(domain, site)
    }

    pub fn delete(&self, domain: &str) -> Option<Arc<Site>> {
        self.sites.remove(domain).map(|(_, site)| site)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn domains(&self) -> Vec<String> {
        self.sites.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Find the site serving `host`, walking up parent domains.
    ///
    /// The host is tried verbatim, then with leading labels removed one at a
    /// time. A single-label remainder (a bare TLD) is never looked up.
    pub fn query_site(&self, host: &str) -> Result<Arc<Site>, SiteError> {
        if let Some(site) = self.get(host) {
            return Ok(site);
        }

        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if !parent.contains('.') {
                break;
            }
            if let Some(site) = self.get(parent) {
                return Ok(site);
            }
            rest = parent;
        }

        Err(SiteError::SiteNotFound(host.to_string()))
    }
}
