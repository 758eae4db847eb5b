//! Structural HTML rewriting and text transforms
//!
//! The structural pass streams the document through `lol_html` and emits
//! deferred tags (see [`tags`]) instead of request-specific values. Its output
//! is what the cache stores; [`tags::resolve_tags`] and
//! [`tags::HostRewriter`] finish it per request.

pub mod charset;
pub mod decoy;
pub mod tags;

use crate::convert::TextConverter;
use lol_html::html_content::{ContentType, Element, EndTag};
use lol_html::{doc_comments, doc_text, element, end, HtmlRewriter, Settings};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;
use url::Url;

pub use tags::{resolve_tags, HostRewriter, TagValues};

/// Marks emitted while text is transformed; expanded into tags afterwards so
/// later find patterns never match inside an earlier substitution.
const REPLACE_MARK: char = '\u{E000}';
const KEYWORD_MARK: char = '\u{E001}';
const MARK_INDEX_BASE: u32 = 0xF0000;

/// Placeholder for a synthesized heading, resolved once the walk is over
const H1_SLOT: &str = "{{h1_slot}}";

const TRANSFORMED_ATTRIBUTES: &[&str] = &["title", "alt", "value", "placeholder"];

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("html rewriting failed: {0}")]
    Rewriting(#[from] lol_html::errors::RewritingError),
    #[error("rewritten html is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Per-document inputs of the structural pass
#[derive(Clone, Copy)]
pub struct HtmlRules<'a> {
    pub finds: &'a [String],
    pub h1_replace: &'a str,
    pub need_js: bool,
    pub converter: Option<&'a dyn TextConverter>,
    /// Number of configured keywords available for title splicing
    pub keyword_count: usize,
    pub title_replace: bool,
    pub upstream: &'a Url,
    pub upstream_authority: &'a str,
    pub is_index: bool,
}

#[derive(Default)]
struct WalkState {
    text_buf: String,
    /// Open elements whose text must be dropped
    skip_depth: usize,
    splice_title: bool,
    /// Inside an `<h1>` whose first child has not been seen yet
    h1_pending: bool,
    replaced_h1: bool,
    seen_head: bool,
    seen_body: bool,
}

fn mark(kind: char, index: usize) -> String {
    let index = char::from_u32(MARK_INDEX_BASE + index as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
    let mut out = String::with_capacity(8);
    out.push(kind);
    out.push(index);
    out
}

fn expand_marks(text: &str) -> String {
    if !text.contains(REPLACE_MARK) && !text.contains(KEYWORD_MARK) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == REPLACE_MARK || c == KEYWORD_MARK {
            if let Some(index) = chars.peek().and_then(|i| (*i as u32).checked_sub(MARK_INDEX_BASE)) {
                chars.next();
                let index = index as usize;
                out.push_str(&if c == REPLACE_MARK {
                    tags::replace_tag(index)
                } else {
                    tags::keyword_tag(index)
                });
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Apply the find list in order, then the converter.
///
/// Each match of `finds[i]` becomes `{{replace:i}}`; what a match is replaced
/// with is decided when the tag is resolved.
pub fn transform_text(text: &str, finds: &[String], converter: Option<&dyn TextConverter>) -> String {
    let mut out = text.to_string();
    for (i, find) in finds.iter().enumerate() {
        if !find.is_empty() && out.contains(find.as_str()) {
            out = out.replace(find.as_str(), &mark(REPLACE_MARK, i));
        }
    }
    if let Some(converter) = converter {
        match converter.convert(&out) {
            Ok(converted) => out = converted,
            Err(e) => warn!(error = %e, "Text conversion failed, keeping original text"),
        }
    }
    expand_marks(&out)
}

/// Byte offsets where a keyword may be inserted without splitting an entity
fn splice_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(text.len() + 1);
    let mut in_entity = false;
    for (i, c) in text.char_indices() {
        if !in_entity {
            offsets.push(i);
        }
        match c {
            '&' => in_entity = true,
            ';' => in_entity = false,
            c if in_entity && !(c.is_ascii_alphanumeric() || c == '#') => in_entity = false,
            _ => {}
        }
    }
    offsets.push(text.len());
    offsets
}

fn splice_keyword(title: &str, keyword_count: usize) -> String {
    let mut rng = rand::thread_rng();
    let keyword = mark(KEYWORD_MARK, rng.gen_range(0..keyword_count));
    let offsets = splice_offsets(title);
    let at = offsets.choose(&mut rng).copied().unwrap_or(title.len());
    format!("{}{}{}", &title[..at], keyword, &title[at..])
}

/// Encode every non-ASCII character as a decimal character reference
pub fn html_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            out.push_str(&format!("&#{};", c as u32));
        }
    }
    out
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Whether an absolute or protocol-relative link has nothing after its authority
fn has_empty_path(href: &str) -> bool {
    let rest = match href.find("//") {
        Some(pos) if href[..pos].chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.' || c == ':') => {
            &href[pos + 2..]
        }
        _ => return false,
    };
    match rest.find(['/', '?', '#']) {
        None => true,
        Some(pos) => !rest[pos..].starts_with('/'),
    }
}

fn same_origin_host(a: &Url, b: &Url) -> bool {
    a.host_str().is_some() && a.host_str() == b.host_str() && a.port() == b.port()
}

/// Drop text inside the element until its end tag
fn skip_text_until_end(el: &mut Element<'_, '_>, state: &Rc<RefCell<WalkState>>) {
    if let Some(handlers) = el.end_tag_handlers() {
        state.borrow_mut().skip_depth += 1;
        let state = Rc::clone(state);
        handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
            let mut st = state.borrow_mut();
            st.skip_depth = st.skip_depth.saturating_sub(1);
            Ok(())
        }));
    }
}

fn transform_anchor(el: &mut Element<'_, '_>, rules: &HtmlRules<'_>) -> lol_html::HandlerResult {
    let Some(href) = el.get_attribute("href") else {
        return Ok(());
    };
    if href.is_empty() {
        return Ok(());
    }
    let Ok(resolved) = rules.upstream.join(&href) else {
        return Ok(());
    };

    if same_origin_host(&resolved, rules.upstream) {
        // Left pointing at the upstream; the per-request pass rehosts it
        el.set_attribute("href", resolved.as_str())?;
    } else if has_empty_path(href.trim()) {
        el.remove();
    } else {
        el.set_attribute("href", "#")?;
    }
    Ok(())
}

fn transform_meta(el: &mut Element<'_, '_>, is_index: bool) -> lol_html::HandlerResult {
    if let Some(name) = el.get_attribute("name") {
        if is_index && name.eq_ignore_ascii_case("keywords") {
            el.set_attribute("content", "{{index_keywords}}")?;
            return Ok(());
        }
        if is_index && name.eq_ignore_ascii_case("description") {
            el.set_attribute("content", "{{index_description}}")?;
            return Ok(());
        }
    }
    if el
        .get_attribute("http-equiv")
        .is_some_and(|v| v.eq_ignore_ascii_case("content-type"))
    {
        el.set_attribute("content", "text/html; charset=UTF-8")?;
    }
    if el.has_attribute("charset") {
        el.set_attribute("charset", "UTF-8")?;
    }
    Ok(())
}

/// Decoy block followed by the heading slot, opening the page body
fn body_slots(rules: &HtmlRules<'_>) -> String {
    if rules.h1_replace.is_empty() {
        "{{random_html}}".to_string()
    } else {
        format!("{{{{random_html}}}}{H1_SLOT}")
    }
}

/// Run the structural pass over a UTF-8 HTML document
pub fn rewrite_html(input: &[u8], rules: &HtmlRules<'_>) -> Result<Vec<u8>, RewriteError> {
    let state = Rc::new(RefCell::new(WalkState::default()));
    let mut output = Vec::with_capacity(input.len() + 8192);

    {
        let title_state = Rc::clone(&state);
        let script_state = Rc::clone(&state);
        let h1_state = Rc::clone(&state);
        let head_state = Rc::clone(&state);
        let body_state = Rc::clone(&state);
        let any_state = Rc::clone(&state);
        let text_state = Rc::clone(&state);
        let comment_state = Rc::clone(&state);
        let end_state = Rc::clone(&state);

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![
                    element!("a[href]", move |el| transform_anchor(el, rules)),
                    element!("link[rel][href]", move |el| {
                        if el
                            .get_attribute("rel")
                            .is_some_and(|rel| rel.trim().eq_ignore_ascii_case("alternate"))
                        {
                            el.set_attribute("href", &format!("//{}", rules.upstream_authority))?;
                        }
                        Ok(())
                    }),
                    element!("title", move |el| {
                        if rules.is_index {
                            el.set_inner_content("{{index_title}}", ContentType::Html);
                            skip_text_until_end(el, &title_state);
                        } else if rules.title_replace && rules.keyword_count > 0 {
                            title_state.borrow_mut().splice_title = true;
                            if let Some(handlers) = el.end_tag_handlers() {
                                let state = Rc::clone(&title_state);
                                handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
                                    state.borrow_mut().splice_title = false;
                                    Ok(())
                                }));
                            }
                        }
                        Ok(())
                    }),
                    element!("script", move |el| {
                        if !rules.need_js {
                            el.remove_attribute("src");
                            el.set_inner_content("", ContentType::Text);
                            skip_text_until_end(el, &script_state);
                        }
                        Ok(())
                    }),
                    element!("meta", move |el| transform_meta(el, rules.is_index)),
                    element!("body", move |el| {
                        let mut st = body_state.borrow_mut();
                        if st.seen_body {
                            return Ok(());
                        }
                        st.seen_body = true;
                        if !st.seen_head {
                            st.seen_head = true;
                            el.before("{{inject_js}}", ContentType::Html);
                        }
                        el.prepend(&body_slots(rules), ContentType::Html);
                        if rules.is_index {
                            el.append("{{friend_links}}", ContentType::Html);
                        }
                        Ok(())
                    }),
                    element!("head", move |el| {
                        let mut st = head_state.borrow_mut();
                        if !st.seen_head {
                            st.seen_head = true;
                            el.append("{{inject_js}}", ContentType::Html);
                        }
                        Ok(())
                    }),
                    element!("h1", move |el| {
                        if !rules.h1_replace.is_empty() {
                            h1_state.borrow_mut().h1_pending = true;
                            if let Some(handlers) = el.end_tag_handlers() {
                                let state = Rc::clone(&h1_state);
                                handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
                                    state.borrow_mut().h1_pending = false;
                                    Ok(())
                                }) as _);
                            }
                        }
                        Ok(())
                    }),
                    element!("*", move |el| {
                        if !el.tag_name().eq_ignore_ascii_case("h1") {
                            // A heading whose first child is markup keeps its content
                            any_state.borrow_mut().h1_pending = false;
                        }
                        for name in TRANSFORMED_ATTRIBUTES {
                            if let Some(value) = el.get_attribute(name) {
                                let transformed = transform_text(&value, rules.finds, rules.converter);
                                if transformed != value {
                                    el.set_attribute(name, &transformed)?;
                                }
                            }
                        }
                        Ok(())
                    }),
                ],
                document_content_handlers: vec![
                    doc_text!(move |chunk| {
                        let mut st = text_state.borrow_mut();
                        if st.skip_depth > 0 {
                            chunk.remove();
                            return Ok(());
                        }
                        st.text_buf.push_str(chunk.as_str());
                        if !chunk.last_in_text_node() {
                            chunk.remove();
                            return Ok(());
                        }
                        let mut raw = std::mem::take(&mut st.text_buf);
                        if st.h1_pending {
                            st.h1_pending = false;
                            if !raw.trim().is_empty() {
                                st.replaced_h1 = true;
                                chunk.replace(rules.h1_replace, ContentType::Text);
                                return Ok(());
                            }
                        }
                        if st.splice_title {
                            raw = splice_keyword(&raw, rules.keyword_count);
                            st.splice_title = false;
                        }
                        let transformed = transform_text(&raw, rules.finds, rules.converter);
                        chunk.replace(&transformed, ContentType::Html);
                        Ok(())
                    }),
                    doc_comments!(move |comment| {
                        comment_state.borrow_mut().h1_pending = false;
                        let transformed = transform_text(comment.text().as_str(), rules.finds, rules.converter);
                        if comment.set_text(&transformed).is_err() {
                            warn!("Transformed comment is not representable, keeping original");
                        }
                        Ok(())
                    }),
                    // Head and body are optional in HTML; a page without them
                    // still gets its slots
                    end!(move |end| {
                        let st = end_state.borrow();
                        if !st.seen_body {
                            end.append(&body_slots(rules), ContentType::Html);
                            if rules.is_index {
                                end.append("{{friend_links}}", ContentType::Html);
                            }
                        }
                        if !st.seen_head {
                            end.append("{{inject_js}}", ContentType::Html);
                        }
                        Ok(())
                    }),
                ],
                ..Settings::default()
            },
            |c: &[u8]| output.extend_from_slice(c),
        );

        rewriter.write(input)?;
        rewriter.end()?;
    }

    let mut html = String::from_utf8(output)?;
    if !rules.h1_replace.is_empty() && html.contains(H1_SLOT) {
        let replaced_h1 = state.borrow().replaced_h1;
        if !replaced_h1 {
            let heading = format!("<h1>{}</h1>", escape_html(rules.h1_replace));
            html = html.replacen(H1_SLOT, &heading, 1);
        }
        html = html.replace(H1_SLOT, "");
    }
    Ok(html.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::CharTableConverter;

    fn upstream() -> Url {
        Url::parse("http://www.origin.com/").unwrap()
    }

    fn rules<'a>(finds: &'a [String], upstream: &'a Url) -> HtmlRules<'a> {
        HtmlRules {
            finds,
            h1_replace: "",
            need_js: true,
            converter: None,
            keyword_count: 0,
            title_replace: false,
            upstream,
            upstream_authority: "www.origin.com",
            is_index: false,
        }
    }

    fn run(html: &str, rules: &HtmlRules<'_>) -> String {
        String::from_utf8(rewrite_html(html.as_bytes(), rules).unwrap()).unwrap()
    }

    #[test]
    fn test_transform_text_chains_in_order() {
        let finds = vec!["a".to_string(), "b".to_string()];
        assert_eq!(transform_text("a b", &finds, None), "{{replace:0}} {{replace:1}}");
    }

    #[test]
    fn test_later_finds_do_not_touch_earlier_tags() {
        let finds = vec!["cat".to_string(), "replace".to_string(), "0".to_string()];
        assert_eq!(transform_text("cat", &finds, None), "{{replace:0}}");
    }

    #[test]
    fn test_transform_text_converts() {
        let converter = CharTableConverter::parse("简簡").unwrap();
        let finds = vec!["x".to_string()];
        assert_eq!(
            transform_text("简x", &finds, Some(&converter)),
            "簡{{replace:0}}"
        );
    }

    #[test]
    fn test_anchor_rewriting() {
        let up = upstream();
        let r = rules(&[], &up);
        let out = run(
            "<a href=\"/p?x=1#f\">in</a><a href=\"http://other.com\">friend</a><a href=\"http://other.com/page\">ext</a>",
            &r,
        );
        assert!(out.contains("<a href=\"http://www.origin.com/p?x=1#f\">in</a>"));
        assert!(!out.contains("friend"));
        assert!(out.contains("<a href=\"#\">ext</a>"));
    }

    #[test]
    fn test_alternate_link() {
        let up = upstream();
        let r = rules(&[], &up);
        let out = run("<link rel=\"alternate\" href=\"https://m.origin.com/\"><link rel=\"stylesheet\" href=\"/a.css\">", &r);
        assert!(out.contains("<link rel=\"alternate\" href=\"//www.origin.com\">"));
        assert!(out.contains("href=\"/a.css\""));
    }

    #[test]
    fn test_index_title_and_meta() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.is_index = true;
        let out = run(
            "<html><head><title>Old</title><meta name=\"keywords\" content=\"k\"><meta name=\"description\" content=\"d\"><meta charset=\"gbk\"></head><body></body></html>",
            &r,
        );
        assert!(out.contains("<title>{{index_title}}</title>"));
        assert!(out.contains("content=\"{{index_keywords}}\""));
        assert!(out.contains("content=\"{{index_description}}\""));
        assert!(out.contains("charset=\"UTF-8\""));
        assert!(out.contains("{{inject_js}}</head>"));
        assert!(out.contains("<body>{{random_html}}{{friend_links}}</body>"));
    }

    #[test]
    fn test_non_index_page_keeps_meta_and_friend_links_out() {
        let up = upstream();
        let r = rules(&[], &up);
        let out = run(
            "<html><head><title>T</title><meta name=\"keywords\" content=\"k\"><meta http-equiv=\"Content-Type\" content=\"text/html; charset=gb2312\"></head><body>x</body></html>",
            &r,
        );
        assert!(out.contains("<title>T</title>"));
        assert!(out.contains("content=\"k\""));
        assert!(out.contains("content=\"text/html; charset=UTF-8\""));
        assert!(!out.contains("{{friend_links}}"));
    }

    #[test]
    fn test_title_keyword_splice() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.title_replace = true;
        r.keyword_count = 1;
        let out = run("<html><head><title>Hello &amp; World</title></head></html>", &r);
        let title = out.split("<title>").nth(1).unwrap().split("</title>").next().unwrap();
        assert!(title.contains("{{keyword:0}}"));
        assert_eq!(title.replace("{{keyword:0}}", ""), "Hello &amp; World");
    }

    #[test]
    fn test_title_untouched_without_keywords() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.title_replace = true;
        let out = run("<title>Plain</title>", &r);
        assert!(out.contains("<title>Plain</title>"));
    }

    #[test]
    fn test_scripts_neutralized() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.need_js = false;
        let out = run("<script src=\"/a.js\"></script><script>alert(1)</script><p>ok</p>", &r);
        assert!(!out.contains("a.js"));
        assert!(!out.contains("alert"));
        assert_eq!(out.matches("<script").count(), 2);
        assert!(out.contains("<p>ok</p>"));
    }

    #[test]
    fn test_scripts_kept_when_needed() {
        let up = upstream();
        let r = rules(&[], &up);
        let out = run("<script src=\"/a.js\"></script>", &r);
        assert!(out.contains("src=\"/a.js\""));
    }

    #[test]
    fn test_h1_replaced_in_place() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.h1_replace = "New <Heading>";
        let out = run("<html><body><div><h1>Old</h1></div></body></html>", &r);
        assert!(out.contains("<h1>New &lt;Heading&gt;</h1>"));
        assert!(!out.contains("Old"));
        assert!(!out.contains(H1_SLOT));
        assert_eq!(out.matches("<h1>").count(), 1);
    }

    #[test]
    fn test_h1_synthesized_after_decoy() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.h1_replace = "Heading";
        let out = run("<html><body><p>text</p></body></html>", &r);
        assert!(out.contains("<body>{{random_html}}<h1>Heading</h1><p>text</p>"));
    }

    #[test]
    fn test_h1_with_markup_first_child_kept() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.h1_replace = "Heading";
        let out = run("<html><body><h1><a href=\"/\">Logo</a></h1></body></html>", &r);
        assert!(out.contains("<h1><a href=\"http://www.origin.com/\">Logo</a></h1>"));
        assert!(out.contains("<body>{{random_html}}<h1>Heading</h1>"));
    }

    #[test]
    fn test_h1_first_text_replaced_rest_kept() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.h1_replace = "Heading";
        let out = run("<body><h1>Old <b>bold</b></h1><h1></h1></body>", &r);
        assert!(out.contains("<h1>Heading<b>bold</b></h1><h1></h1>"));
        assert!(!out.contains("Old"));
        assert!(!out.contains("{{h1_slot}}"));
    }

    #[test]
    fn test_page_without_head_or_body_gets_slots() {
        let up = upstream();
        let mut r = rules(&[], &up);
        r.h1_replace = "Heading";
        r.is_index = true;
        let out = run("<!DOCTYPE html><title>T</title><p>hello</p>", &r);
        assert_eq!(
            out,
            "<!DOCTYPE html><title>{{index_title}}</title><p>hello</p>{{random_html}}<h1>Heading</h1>{{friend_links}}{{inject_js}}"
        );
    }

    #[test]
    fn test_body_without_head_gets_inject_before_body() {
        let up = upstream();
        let r = rules(&[], &up);
        let out = run("<title>T</title><body><p>x</p></body>", &r);
        assert_eq!(out, "<title>T</title>{{inject_js}}<body>{{random_html}}<p>x</p></body>");
        assert_eq!(out.matches("{{inject_js}}").count(), 1);
    }

    #[test]
    fn test_text_comment_and_attribute_replacement() {
        let up = upstream();
        let finds = vec!["bad".to_string()];
        let r = rules(&finds, &up);
        let out = run(
            "<p title=\"bad title\">a bad word</p><!-- bad --><img alt=\"bad\" src=\"bad.png\">",
            &r,
        );
        assert!(out.contains("title=\"{{replace:0}} title\""));
        assert!(out.contains("a {{replace:0}} word"));
        assert!(out.contains("<!-- {{replace:0}} -->"));
        assert!(out.contains("alt=\"{{replace:0}}\""));
        assert!(out.contains("src=\"bad.png\""));
    }

    #[test]
    fn test_html_entities() {
        assert_eq!(html_entities("Shop 商店"), "Shop &#21830;&#24215;");
        assert_eq!(html_entities("plain"), "plain");
    }

    #[test]
    fn test_has_empty_path() {
        assert!(has_empty_path("http://a.com"));
        assert!(has_empty_path("//a.com?x=1"));
        assert!(!has_empty_path("http://a.com/"));
        assert!(!has_empty_path("/relative"));
        assert!(!has_empty_path("page.html"));
    }

    #[test]
    fn test_splice_offsets_skip_entities() {
        assert_eq!(splice_offsets("a&amp;b"), vec![0, 1, 6, 7]);
    }
}
