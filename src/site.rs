//! Compiled per-domain mirror pipeline
//!
//! A [`Site`] is built once from a [`SiteConfig`] and never mutated. Updating a
//! domain builds a new instance and swaps it into the registry; requests that
//! already hold the old `Arc<Site>` finish against it.

use crate::cache::{normalize_content_type, CachedResponse};
use crate::context::MirrorContext;
use crate::error::{error_response, full_body, MirrorErrorCode, ProxyBody, SiteError};
use crate::recorder::Record;
use crate::registry::SiteRegistry;
use crate::request::InboundRequest;
use crate::rewrite::charset::{normalize_to_utf8, strip_invisible};
use crate::rewrite::{decoy, html_entities, resolve_tags, rewrite_html, HostRewriter, HtmlRules, TagValues};
use crate::transport::{authority, strip_hop_by_hop, UpstreamResponse};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Body served for upstream 4xx responses and blocked crawlers
pub const PAGE_NOT_FOUND: &str = "page not found";

/// Body served when upstream failed and nothing was cached
pub const UPSTREAM_FAILED: &str = "request failed, please check the upstream site";

/// Persisted policy for one mirrored domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub id: i64,
    pub domain: String,
    pub url: String,
    pub index_title: String,
    pub index_keywords: String,
    pub index_description: String,
    /// Substrings to replace, paired by position with `replaces`
    pub finds: Vec<String>,
    pub replaces: Vec<String>,
    #[serde(rename = "h1replace")]
    pub h1_replace: String,
    pub need_js: bool,
    pub s2t: bool,
    pub title_replace: bool,
    pub cache_enable: bool,
    /// Cache TTL in minutes
    pub cache_time: i64,
    pub baidu_push_key: String,
    pub sm_push_key: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            id: 0,
            domain: String::new(),
            url: String::new(),
            index_title: String::new(),
            index_keywords: String::new(),
            index_description: String::new(),
            finds: Vec::new(),
            replaces: Vec::new(),
            h1_replace: String::new(),
            need_js: false,
            s2t: false,
            title_replace: false,
            cache_enable: true,
            cache_time: 1440,
            baidu_push_key: String::new(),
            sm_push_key: String::new(),
        }
    }
}

impl SiteConfig {
    pub fn new(domain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Registry key form of a domain: trimmed, no trailing dot, lowercase
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

pub struct Site {
    config: SiteConfig,
    domain: String,
    upstream: Url,
    upstream_authority: String,
    host_rewriter: HostRewriter,
    index_title: String,
    index_keywords: String,
    index_description: String,
    finds: Vec<String>,
    /// Effective replacement per find, entity-encoded and already chained
    /// through every later pair
    replaces: Vec<String>,
    ctx: Arc<MirrorContext>,
}

impl Site {
    /// Compile a configuration. Fails without side effects on a bad upstream URL.
    pub fn build(config: SiteConfig, ctx: Arc<MirrorContext>) -> Result<Self, SiteError> {
        let domain = normalize_domain(&config.domain);
        if domain.is_empty() {
            return Err(SiteError::EmptyDomain);
        }

        let upstream = Url::parse(config.url.trim()).map_err(|source| SiteError::InvalidUpstreamUrl {
            url: config.url.clone(),
            source,
        })?;
        if upstream.host_str().map_or(true, str::is_empty) {
            return Err(SiteError::MissingUpstreamHost(config.url.clone()));
        }
        let upstream_authority = authority(&upstream);

        let mut pairs: Vec<(String, String)> = config
            .finds
            .iter()
            .enumerate()
            .map(|(i, find)| (find.clone(), config.replaces.get(i).cloned().unwrap_or_default()))
            .collect();
        pairs.extend(
            ctx.global_replace
                .iter()
                .map(|rule| (rule.find.clone(), rule.replace.clone())),
        );
        pairs.retain(|(find, _)| !find.is_empty());

        let finds: Vec<String> = pairs.iter().map(|(find, _)| find.clone()).collect();
        let encoded: Vec<String> = pairs.iter().map(|(_, replace)| html_entities(replace)).collect();
        let replaces = chain_replacements(&finds, &encoded);

        Ok(Self {
            host_rewriter: HostRewriter::new(&upstream_authority, &ctx.scheme, &domain),
            index_title: html_entities(&config.index_title),
            index_keywords: html_entities(&config.index_keywords),
            index_description: html_entities(&config.index_description),
            domain,
            upstream,
            upstream_authority,
            finds,
            replaces,
            config,
            ctx,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs((self.config.cache_time.max(0) as u64).saturating_mul(60))
    }

    /// Serve one request: crawler gate, cache probe, upstream fetch, fallback
    pub async fn route(&self, req: &InboundRequest) -> Response<ProxyBody> {
        let ua = req.user_agent();
        let spider = self.ctx.classify_crawler(ua);
        if spider.is_some() && !self.ctx.is_good_crawler(ua) {
            debug!(domain = %self.domain, ua, "Blocking crawler");
            return error_response(MirrorErrorCode::CrawlerBlocked, PAGE_NOT_FOUND);
        }

        if self.config.cache_enable {
            if let Some(cached) =
                self.ctx
                    .cache
                    .lookup(&req.host, req.path(), req.query(), self.ttl(), false)
            {
                debug!(host = %req.host, path = req.path(), "Cache hit");
                return self.serve_cached(req, cached, spider.as_deref(), true);
            }
        }

        match self.ctx.transport.forward(&self.upstream, req).await {
            Ok(response) => self.modify_response(req, response, spider.as_deref()),
            Err(e) => self.error_fallback(req, &e.to_string()),
        }
    }

    /// Intercept an upstream response: rehome redirects, rewrite and cache 200s,
    /// replace and cache 4xx, pass everything else through.
    pub fn modify_response(
        &self,
        req: &InboundRequest,
        response: UpstreamResponse,
        spider: Option<&str>,
    ) -> Response<ProxyBody> {
        let status = response.status;
        if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
            return self.rehome_redirect(req, response);
        }
        if status == StatusCode::OK {
            return self.handle_ok(req, response, spider);
        }
        if status.is_client_error() {
            let mut headers = response.headers;
            headers.remove(CONTENT_ENCODING);
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
            self.store(req, status, &headers, PAGE_NOT_FOUND.as_bytes(), "");
            return respond(status, headers, Bytes::from_static(PAGE_NOT_FOUND.as_bytes()));
        }
        respond(status, response.headers, response.body)
    }

    fn handle_ok(
        &self,
        req: &InboundRequest,
        response: UpstreamResponse,
        spider: Option<&str>,
    ) -> Response<ProxyBody> {
        let status = response.status;
        let mut headers = response.headers;

        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());
        let body = match encoding.as_deref() {
            None | Some("") | Some("identity") => response.body,
            Some("gzip") | Some("x-gzip") => match gunzip(&response.body) {
                Ok(body) => body,
                Err(e) => {
                    return self.error_fallback(req, &format!("invalid gzip body: {e}"));
                }
            },
            Some(other) => {
                debug!(encoding = other, "Unsupported content encoding, passing through");
                return respond(status, headers, response.body);
            }
        };
        headers.remove(CONTENT_ENCODING);

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let lowered = content_type.to_ascii_lowercase();

        if lowered.contains("text/html") {
            let utf8 = normalize_to_utf8(&body, &lowered);
            let text = String::from_utf8_lossy(&utf8);
            let cleaned = strip_invisible(&text);
            let canonical = self.rewrite_document(&cleaned, &response.url, req.is_index());
            let random_html = decoy::random_html(&self.domain, &self.ctx.scheme);

            set_content_type(&mut headers, &content_type);
            self.store(req, status, &headers, canonical.as_bytes(), &random_html);
            if let Some(spider) = spider {
                self.record(req, spider);
            }
            let body = self.finalize_html(&canonical, req, &random_html, spider.is_some());
            return respond(status, headers, Bytes::from(body));
        }

        if lowered.contains("css") || lowered.contains("javascript") {
            let utf8 = normalize_to_utf8(&body, &lowered);
            let canonical = String::from_utf8_lossy(&utf8).into_owned();
            set_content_type(&mut headers, &content_type);
            self.store(req, status, &headers, canonical.as_bytes(), "");
            let body = self.host_rewriter.rewrite(&canonical, &req.host);
            return respond(status, headers, Bytes::from(body));
        }

        self.store(req, status, &headers, &body, "");
        respond(status, headers, body)
    }

    /// Structural pass; malformed markup degrades to the unmodified text
    fn rewrite_document(&self, html: &str, page_url: &Url, is_index: bool) -> String {
        let converter = if self.config.s2t {
            Some(self.ctx.converter.as_ref())
        } else {
            None
        };
        let rules = HtmlRules {
            finds: &self.finds,
            h1_replace: &self.config.h1_replace,
            need_js: self.config.need_js,
            converter,
            keyword_count: self.ctx.keywords.len(),
            title_replace: self.config.title_replace,
            upstream: page_url,
            upstream_authority: &self.upstream_authority,
            is_index,
        };
        match rewrite_html(html.as_bytes(), &rules) {
            Ok(bytes) => String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
            Err(e) => {
                warn!(domain = %self.domain, url = %page_url, error = %e, "HTML rewrite failed, serving original");
                html.to_string()
            }
        }
    }

    /// Per-request pass over a canonical document
    pub fn finalize_html(
        &self,
        canonical: &str,
        req: &InboundRequest,
        random_html: &str,
        is_crawler: bool,
    ) -> String {
        let rehosted = self.host_rewriter.rewrite(canonical, &req.host);
        let inject_js = if is_crawler {
            String::new()
        } else {
            self.ctx.inject_js_tag()
        };
        let friend_links = if req.is_index() {
            self.ctx.friend_links_html(&self.domain)
        } else {
            String::new()
        };
        let values = TagValues {
            index_title: &self.index_title,
            index_keywords: &self.index_keywords,
            index_description: &self.index_description,
            random_html,
            inject_js: &inject_js,
            friend_links: &friend_links,
            keywords: &self.ctx.keywords,
            replaces: &self.replaces,
        };
        resolve_tags(&rehosted, &values)
    }

    fn serve_cached(
        &self,
        req: &InboundRequest,
        cached: CachedResponse,
        spider: Option<&str>,
        record: bool,
    ) -> Response<ProxyBody> {
        let status = StatusCode::from_u16(cached.status()).unwrap_or(StatusCode::OK);
        let headers = cached.header_map();
        let content_type = cached.content_type().to_ascii_lowercase();

        let body = if content_type.contains("html") {
            if let Some(spider) = spider.filter(|_| record && status == StatusCode::OK) {
                self.record(req, spider);
            }
            let canonical = String::from_utf8_lossy(&cached.body);
            Bytes::from(self.finalize_html(&canonical, req, &cached.random_html, spider.is_some()))
        } else if content_type.contains("css") || content_type.contains("javascript") {
            let utf8 = normalize_to_utf8(&cached.body, &content_type);
            Bytes::from(self.host_rewriter.rewrite(&String::from_utf8_lossy(&utf8), &req.host))
        } else {
            Bytes::from(cached.body)
        };
        respond(status, headers, body)
    }

    fn rehome_redirect(&self, req: &InboundRequest, response: UpstreamResponse) -> Response<ProxyBody> {
        let mut headers = response.headers;
        let target = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| response.url.join(location).ok());

        if let Some(target) = target {
            let mut rehomed = format!("{}://{}{}", self.ctx.scheme, req.host, target.path());
            if let Some(query) = target.query() {
                rehomed.push('?');
                rehomed.push_str(query);
            }
            if let Some(fragment) = target.fragment() {
                rehomed.push('#');
                rehomed.push_str(fragment);
            }
            match HeaderValue::from_str(&rehomed) {
                Ok(value) => {
                    debug!(from = %target, to = %rehomed, "Rehoming redirect");
                    headers.insert(LOCATION, value);
                }
                Err(e) => warn!(location = %rehomed, error = %e, "Cannot rehome redirect"),
            }
        }
        respond(response.status, headers, response.body)
    }

    /// Serve the last stored copy regardless of age, or a plain 404
    fn error_fallback(&self, req: &InboundRequest, reason: &str) -> Response<ProxyBody> {
        warn!(
            domain = %self.domain,
            host = %req.host,
            path = req.path(),
            error = reason,
            "Upstream failed, falling back to cache"
        );
        let spider = self.ctx.classify_crawler(req.user_agent());
        match self
            .ctx
            .cache
            .lookup(&req.host, req.path(), req.query(), self.ttl(), true)
        {
            Some(cached) => self.serve_cached(req, cached, spider.as_deref(), false),
            None => error_response(MirrorErrorCode::UpstreamUnavailable, UPSTREAM_FAILED),
        }
    }

    fn store(&self, req: &InboundRequest, status: StatusCode, headers: &HeaderMap, body: &[u8], random_html: &str) {
        if let Err(e) = self.ctx.cache.store(
            &req.host,
            req.path(),
            req.query(),
            status.as_u16(),
            headers,
            body,
            random_html,
        ) {
            warn!(host = %req.host, path = req.path(), error = %e, "Failed to write cache entry");
        }
    }

    fn record(&self, req: &InboundRequest, spider: &str) {
        self.ctx
            .recorder
            .record(Record::now(&req.host, req.path(), req.user_agent(), spider));
    }
}

/// Build a site and swap it into the registry
pub fn make_site(
    config: SiteConfig,
    ctx: Arc<MirrorContext>,
    registry: &SiteRegistry,
) -> Result<Arc<Site>, SiteError> {
    let site = Arc::new(Site::build(config, ctx)?);
    if registry.swap(Arc::clone(&site)).is_some() {
        info!(domain = %site.domain(), upstream = %site.upstream(), "Site replaced");
    } else {
        info!(domain = %site.domain(), upstream = %site.upstream(), "Site registered");
    }
    Ok(site)
}

/// Outcome of reconciling the registry with a full set of configs
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub registered: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Make the registry hold exactly the sites in `configs`.
///
/// Configs that fail to compile are skipped and logged; a previously
/// registered site for that domain stays in place.
pub fn sync_sites(configs: Vec<SiteConfig>, ctx: &Arc<MirrorContext>, registry: &SiteRegistry) -> SyncResult {
    let mut result = SyncResult::default();
    let mut wanted = std::collections::HashSet::new();

    for config in configs {
        let domain = normalize_domain(&config.domain);
        wanted.insert(domain.clone());
        match make_site(config, Arc::clone(ctx), registry) {
            Ok(_) => result.registered += 1,
            Err(e) => {
                warn!(domain, error = %e, "Failed to build site");
                result.failed.push(domain);
            }
        }
    }

    for domain in registry.domains() {
        if !wanted.contains(&domain) {
            registry.delete(&domain);
            result.removed.push(domain);
        }
    }
    result
}

/// Resolve each replacement through every later find/replace pair, in order
fn chain_replacements(finds: &[String], replaces: &[String]) -> Vec<String> {
    (0..replaces.len())
        .map(|i| {
            let mut value = replaces[i].clone();
            for j in i + 1..finds.len() {
                if value.contains(finds[j].as_str()) {
                    value = value.replace(finds[j].as_str(), &replaces[j]);
                }
            }
            value
        })
        .collect()
}

fn gunzip(body: &[u8]) -> std::io::Result<Bytes> {
    let mut decoded = Vec::with_capacity(body.len() * 4);
    flate2::read::GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(Bytes::from(decoded))
}

fn set_content_type(headers: &mut HeaderMap, content_type: &str) {
    if let Ok(value) = HeaderValue::from_str(&normalize_content_type(content_type)) {
        headers.insert(CONTENT_TYPE, value);
    }
}

fn respond(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response<ProxyBody> {
    strip_hop_by_hop(&mut headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
