//! Process-wide state shared by every compiled site

use crate::cache::CacheStore;
use crate::convert::{Passthrough, TextConverter};
use crate::recorder::AccessRecorder;
use crate::rewrite::escape_html;
use crate::transport::UpstreamTransport;
use hyper::body::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// A link shown on a site's index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendLink {
    pub url: String,
    pub text: String,
}

/// Global replace rule appended to every site's own find list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalReplace {
    pub find: String,
    pub replace: String,
}

pub struct MirrorContext {
    /// Scheme the mirror is served under
    pub scheme: String,
    spiders: Vec<String>,
    good_spiders: Vec<String>,
    pub keywords: Vec<String>,
    friend_links: HashMap<String, Vec<FriendLink>>,
    pub inject_js_path: String,
    pub inject_js: Bytes,
    pub global_replace: Vec<GlobalReplace>,
    pub cache: CacheStore,
    pub transport: UpstreamTransport,
    pub recorder: AccessRecorder,
    pub converter: Arc<dyn TextConverter>,
}

impl MirrorContext {
    pub fn new(cache: CacheStore, transport: UpstreamTransport, recorder: AccessRecorder) -> Self {
        Self {
            scheme: "http".to_string(),
            spiders: Vec::new(),
            good_spiders: Vec::new(),
            keywords: Vec::new(),
            friend_links: HashMap::new(),
            inject_js_path: "/__mirror/inject.js".to_string(),
            inject_js: Bytes::new(),
            global_replace: Vec::new(),
            cache,
            transport,
            recorder,
            converter: Arc::new(Passthrough),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Crawler UA substrings; matching is case-insensitive
    pub fn with_spiders(mut self, spiders: &[String], good_spiders: &[String]) -> Self {
        self.spiders = lowercase_all(spiders);
        self.good_spiders = lowercase_all(good_spiders);
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_friend_links(mut self, links: HashMap<String, Vec<FriendLink>>) -> Self {
        self.friend_links = links;
        self
    }

    pub fn with_inject_js(mut self, path: impl Into<String>, script: impl Into<Bytes>) -> Self {
        self.inject_js_path = path.into();
        self.inject_js = script.into();
        self
    }

    pub fn with_global_replace(mut self, rules: Vec<GlobalReplace>) -> Self {
        self.global_replace = rules;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn TextConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// The matching spider name when `user_agent` belongs to a crawler
    pub fn classify_crawler(&self, user_agent: &str) -> Option<String> {
        let ua = user_agent.to_ascii_lowercase();
        self.spiders
            .iter()
            .find(|spider| !spider.is_empty() && ua.contains(spider.as_str()))
            .cloned()
    }

    pub fn is_good_crawler(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.good_spiders
            .iter()
            .any(|spider| !spider.is_empty() && ua.contains(spider.as_str()))
    }

    pub fn inject_js_tag(&self) -> String {
        format!(
            "<script type=\"text/javascript\" src=\"{}\"></script>",
            escape_html(&self.inject_js_path)
        )
    }

    /// Hidden block of friend links for `domain`, empty when none are configured
    pub fn friend_links_html(&self, domain: &str) -> String {
        let Some(links) = self.friend_links.get(domain).filter(|links| !links.is_empty()) else {
            return String::new();
        };
        let anchors: String = links
            .iter()
            .map(|link| format!("<a href='{}' target='_blank'>{}</a>", link.url, link.text))
            .collect();
        format!("<div style='display:none'>{anchors}</div>")
    }

    #[cfg(test)]
    pub(crate) fn for_tests(cache_root: impl Into<std::path::PathBuf>) -> Self {
        use crate::transport::TransportConfig;
        let transport = UpstreamTransport::new(TransportConfig::default()).expect("transport");
        Self::new(CacheStore::new(cache_root), transport, AccessRecorder::disabled())
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}
