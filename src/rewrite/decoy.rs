//! Randomized hidden decoy markup

use rand::seq::SliceRandom;
use rand::Rng;

const DECOY_ITEMS: usize = 100;
/// Percentage of items rendered as subdomain anchors
const ANCHOR_PERCENT: u32 = 20;

const DECOY_TAGS: &[&str] = &[
    "abbr", "address", "area", "article", "aside", "b", "base", "bdo", "blockquote", "button",
    "cite", "code", "dd", "del", "details", "dfn", "dl", "dt", "em", "figure", "font", "i", "ins",
    "kbd", "label", "legend", "li", "mark", "meter", "ol", "option", "p", "q", "progress", "rt",
    "ruby", "samp", "section", "select", "small", "strong", "tt", "u",
];

const DOUBLE_SUFFIXES: &[&str] = &["com.cn", "net.cn", "org.cn"];

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random ASCII letters, length in `min..max` (exactly `min` when the range is empty)
pub fn rand_str(min: usize, max: usize) -> String {
    let mut rng = rand::thread_rng();
    let len = if max > min { rng.gen_range(min..max) } else { min };
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Whether the host sits under a two-label public suffix such as `com.cn`
pub fn is_double_suffix(host: &str) -> bool {
    DOUBLE_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
}

/// Whether decoy anchors may point at invented subdomains of `domain`.
/// Only registrable roots qualify: two labels, or three under a double suffix.
fn accepts_subdomain_anchors(domain: &str) -> bool {
    let labels = domain.split('.').count();
    labels == 2 || (labels == 3 && is_double_suffix(domain))
}

/// Build a hidden container of random inline elements.
///
/// About one in five items becomes an anchor to a random third-level
/// subdomain of `domain` when the domain is a registrable root.
pub fn random_html(domain: &str, scheme: &str) -> String {
    let mut rng = rand::thread_rng();
    let anchors = accepts_subdomain_anchors(domain);
    let mut out = String::with_capacity(DECOY_ITEMS * 40);
    out.push_str("<div style=\"display:none\">");

    for _ in 0..DECOY_ITEMS {
        if anchors && rng.gen_range(0..100) < ANCHOR_PERCENT {
            out.push_str(&format!(
                "<a href=\"{}://{}.{}\" target=\"_blank\">{}</a>",
                scheme,
                rand_str(3, 5),
                domain,
                rand_str(6, 16)
            ));
            continue;
        }
        let tag = DECOY_TAGS.choose(&mut rng).copied().unwrap_or("span");
        out.push_str(&format!(
            "<{tag} id=\"{}\">{}</{tag}>",
            rand_str(4, 8),
            rand_str(6, 16)
        ));
    }

    out.push_str("</div>");
    out
}
