use crate::context::{FriendLink, GlobalReplace};
use crate::convert::{CharTableConverter, Passthrough, TextConverter};
use crate::transport::TransportConfig;
use anyhow::Context;
use hyper::body::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Global configuration for the mirror
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and storage settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Mirroring behavior shared by every site
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public mirror port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, always bound to localhost
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// SQLite database holding site configs and access records
    #[serde(default = "default_database_path")]
    pub database: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            database: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ReplaceRule {
    pub find: String,
    #[serde(default)]
    pub replace: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    /// Root directory of the response cache
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    /// Scheme the mirror is served under (http or https)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// User-Agent substrings identifying crawlers
    #[serde(default = "default_spiders")]
    pub spiders: Vec<String>,

    /// Crawlers that are served despite matching `spiders`
    #[serde(default = "default_good_spiders")]
    pub good_spiders: Vec<String>,

    /// Replaces the client User-Agent on upstream requests when non-empty
    #[serde(default)]
    pub upstream_user_agent: String,

    /// Reserved path serving the injected script
    #[serde(default = "default_inject_js_path")]
    pub inject_js_path: String,

    #[serde(default = "default_inject_js_file")]
    pub inject_js_file: String,

    #[serde(default = "default_keywords_file")]
    pub keywords_file: String,

    #[serde(default = "default_friend_links_file")]
    pub friend_links_file: String,

    /// Optional character table enabling script conversion
    pub s2t_table_file: Option<String>,

    /// Outbound source addresses; public IPv4 interfaces are used when empty
    #[serde(default)]
    pub source_ips: Vec<IpAddr>,

    /// Capacity of the access record queue (default: 4096)
    #[serde(default = "default_record_queue_size")]
    pub record_queue_size: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Find/replace pairs appended to every site
    #[serde(default)]
    pub global_replace: Vec<ReplaceRule>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            scheme: default_scheme(),
            spiders: default_spiders(),
            good_spiders: default_good_spiders(),
            upstream_user_agent: String::new(),
            inject_js_path: default_inject_js_path(),
            inject_js_file: default_inject_js_file(),
            keywords_file: default_keywords_file(),
            friend_links_file: default_friend_links_file(),
            s2t_table_file: None,
            source_ips: Vec::new(),
            record_queue_size: default_record_queue_size(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            request_timeout_secs: default_request_timeout(),
            global_replace: Vec::new(),
        }
    }
}

/// Auxiliary files referenced by [`MirrorConfig`]
pub struct MirrorAssets {
    pub keywords: Vec<String>,
    pub friend_links: HashMap<String, Vec<FriendLink>>,
    pub inject_js: Bytes,
    pub converter: Arc<dyn TextConverter>,
}

impl MirrorConfig {
    pub fn transport_config(&self, source_ips: Vec<IpAddr>) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive: Duration::from_secs(self.keepalive_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            source_ips,
            user_agent: Some(self.upstream_user_agent.clone()).filter(|ua| !ua.is_empty()),
        }
    }

    pub fn global_rules(&self) -> Vec<GlobalReplace> {
        self.global_replace
            .iter()
            .map(|rule| GlobalReplace {
                find: rule.find.clone(),
                replace: rule.replace.clone(),
            })
            .collect()
    }

    /// Read the keyword, friend link, script and conversion files.
    /// Missing text files yield empty values; a configured but unreadable
    /// conversion table is an error.
    pub fn load_assets(&self) -> anyhow::Result<MirrorAssets> {
        let keywords = read_optional(&self.keywords_file)?
            .map(|content| parse_keywords(&content))
            .unwrap_or_default();
        let friend_links = read_optional(&self.friend_links_file)?
            .map(|content| parse_friend_links(&content))
            .unwrap_or_default();
        let inject_js = read_optional(&self.inject_js_file)?
            .map(Bytes::from)
            .unwrap_or_default();

        let converter: Arc<dyn TextConverter> = match &self.s2t_table_file {
            Some(path) => {
                let table = CharTableConverter::load(path)
                    .with_context(|| format!("Failed to load conversion table {path}"))?;
                info!(path, entries = table.len(), "Loaded script conversion table");
                Arc::new(table)
            }
            None => Arc::new(Passthrough),
        };

        info!(
            keywords = keywords.len(),
            friend_link_domains = friend_links.len(),
            inject_js_bytes = inject_js.len(),
            "Loaded mirror assets"
        );

        Ok(MirrorAssets {
            keywords,
            friend_links,
            inject_js,
            converter,
        })
    }
}

fn read_optional(path: &str) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path, "Optional asset not found");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {path}")),
    }
}

/// One keyword per line; blank lines are skipped
pub fn parse_keywords(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Lines of `domain||url,text||url,text`
pub fn parse_friend_links(content: &str) -> HashMap<String, Vec<FriendLink>> {
    let mut links = HashMap::new();
    for line in content.lines() {
        let mut fields = line.trim_end_matches('\r').split("||");
        let Some(domain) = fields.next().map(str::trim).filter(|d| !d.is_empty()) else {
            continue;
        };
        let entries: Vec<FriendLink> = fields
            .filter_map(|item| {
                let (url, text) = item.split_once(',')?;
                Some(FriendLink {
                    url: url.trim().to_string(),
                    text: text.trim().to_string(),
                })
            })
            .collect();
        if !entries.is_empty() {
            links.insert(domain.to_ascii_lowercase(), entries);
        }
    }
    links
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_database_path() -> String {
    "data/mirror.db".to_string()
}

fn default_cache_path() -> String {
    "cache".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_spiders() -> Vec<String> {
    [
        "baiduspider",
        "googlebot",
        "bingbot",
        "360spider",
        "sogou",
        "yisouspider",
        "bytespider",
        "yandexbot",
        "ahrefsbot",
        "semrushbot",
        "mj12bot",
        "dotbot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_good_spiders() -> Vec<String> {
    ["baiduspider", "googlebot", "bingbot", "360spider", "sogou", "yisouspider", "bytespider"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_inject_js_path() -> String {
    "/__mirror/inject.js".to_string()
}

fn default_inject_js_file() -> String {
    "config/inject.js".to_string()
}

fn default_keywords_file() -> String {
    "config/keywords.txt".to_string()
}

fn default_friend_links_file() -> String {
    "config/links.txt".to_string()
}

fn default_record_queue_size() -> usize {
    4096
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mirror = &self.mirror;

        if mirror.scheme != "http" && mirror.scheme != "https" {
            errors.push(format!("mirror.scheme must be http or https, got '{}'", mirror.scheme));
        }
        if !mirror.inject_js_path.starts_with('/') {
            errors.push(format!(
                "mirror.inject_js_path must start with '/', got '{}'",
                mirror.inject_js_path
            ));
        }
        if mirror.record_queue_size == 0 {
            errors.push("mirror.record_queue_size must be greater than 0".to_string());
        }
        for (i, rule) in mirror.global_replace.iter().enumerate() {
            if rule.find.is_empty() {
                errors.push(format!("mirror.global_replace[{i}]: 'find' must not be empty"));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
