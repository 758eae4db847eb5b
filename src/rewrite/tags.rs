//! Per-request text pass: host rewriting and deferred tag resolution
//!
//! Tag grammar shared with the structural pass:
//!
//! - `{{index_title}}`, `{{index_keywords}}`, `{{index_description}}`
//! - `{{random_html}}`, `{{inject_js}}`, `{{friend_links}}`
//! - `{{keyword:N}}` and `{{replace:N}}`, indices into the keyword and
//!   replacement lists. Unknown indices resolve to nothing.
//!
//! Literal tags resolve before indexed tags, so configured values such as the
//! index title may themselves carry `{{keyword:N}}`.

use crate::rewrite::decoy::is_double_suffix;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::LazyLock;

static LITERAL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{(index_title|index_keywords|index_description|random_html|inject_js|friend_links)\}\}")
        .expect("valid literal tag regex")
});

static INDEXED_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(keyword|replace):(\d+)\}\}").expect("valid indexed tag regex"));

pub fn keyword_tag(index: usize) -> String {
    format!("{{{{keyword:{index}}}}}")
}

pub fn replace_tag(index: usize) -> String {
    format!("{{{{replace:{index}}}}}")
}

/// Rewrites references to the upstream host into the requesting host
#[derive(Debug, Clone)]
pub struct HostRewriter {
    upstream_authority: String,
    scheme: String,
    domain: String,
    /// Parent of the upstream host and a matcher for its other subdomains
    parent: Option<(String, Regex)>,
}

impl HostRewriter {
    /// `upstream_authority` is `host[:port]` of the upstream URL, `scheme` the
    /// scheme the mirror serves, `domain` the site's configured domain.
    pub fn new(upstream_authority: &str, scheme: &str, domain: &str) -> Self {
        let upstream_host = upstream_authority
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(upstream_authority);

        Self {
            upstream_authority: upstream_authority.to_string(),
            scheme: scheme.to_string(),
            domain: domain.to_string(),
            parent: collapsible_parent(upstream_host),
        }
    }

    pub fn rewrite(&self, content: &str, host: &str) -> String {
        let mut out = content.replace(&self.upstream_authority, host);

        let (from, to) = if self.scheme == "https" {
            (format!("http://{host}"), format!("https://{host}"))
        } else {
            (format!("https://{host}"), format!("http://{host}"))
        };
        out = out.replace(&from, &to);

        if let Some((parent, subdomains)) = &self.parent {
            if let Cow::Owned(collapsed) = subdomains.replace_all(&out, self.domain.as_str()) {
                out = collapsed;
            }
            out = replace_bare_host(&out, parent, &self.domain);
        }
        out
    }
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.'
}

/// Replace `host` only where it stands as a whole host name, so a longer name
/// that merely ends with it is left alone
fn replace_bare_host(content: &str, host: &str, with: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for (at, _) in content.match_indices(host) {
        let end = at + host.len();
        let before = content[..at].chars().next_back();
        let after = content[end..].chars().next();
        let standalone = !before.is_some_and(is_host_char)
            && !after.is_some_and(|c| c.is_ascii_alphanumeric() || c == '-');
        if standalone {
            out.push_str(&content[last..at]);
            out.push_str(with);
            last = end;
        }
    }
    out.push_str(&content[last..]);
    out
}

/// Parent domain worth collapsing: the upstream host must not be an IP, must
/// have at least three labels, and its parent must not be a public suffix.
fn collapsible_parent(upstream_host: &str) -> Option<(String, Regex)> {
    if upstream_host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let (_, parent) = upstream_host.split_once('.')?;
    if !parent.contains('.') || (is_double_suffix(parent) && parent.split('.').count() == 2) {
        return None;
    }
    let pattern = format!(r"\b[a-zA-Z0-9][a-zA-Z0-9-]*\.{}", regex::escape(parent));
    let subdomains = Regex::new(&pattern).ok()?;
    Some((parent.to_string(), subdomains))
}

/// Values substituted for deferred tags on one request
#[derive(Debug, Default, Clone, Copy)]
pub struct TagValues<'a> {
    pub index_title: &'a str,
    pub index_keywords: &'a str,
    pub index_description: &'a str,
    pub random_html: &'a str,
    pub inject_js: &'a str,
    pub friend_links: &'a str,
    pub keywords: &'a [String],
    pub replaces: &'a [String],
}

/// Resolve every recognized tag in `content`
pub fn resolve_tags(content: &str, values: &TagValues<'_>) -> String {
    let literal = LITERAL_TAG.replace_all(content, |caps: &Captures<'_>| match &caps[1] {
        "index_title" => values.index_title,
        "index_keywords" => values.index_keywords,
        "index_description" => values.index_description,
        "random_html" => values.random_html,
        "inject_js" => values.inject_js,
        "friend_links" => values.friend_links,
        _ => "",
    });

    let indexed = INDEXED_TAG.replace_all(&literal, |caps: &Captures<'_>| {
        let list = if &caps[1] == "keyword" {
            values.keywords
        } else {
            values.replaces
        };
        caps[2]
            .parse::<usize>()
            .ok()
            .and_then(|i| list.get(i))
            .map(String::as_str)
            .unwrap_or("")
            .to_string()
    });

    indexed.into_owned()
}
