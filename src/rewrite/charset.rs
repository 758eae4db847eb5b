//! Charset sniffing and transcoding to UTF-8

use encoding_rs::{Encoding, GBK, UTF_8};
use regex::bytes::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Bytes inspected for a `<meta charset>` declaration
const SNIFF_LEN: usize = 1024;

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?\s*([a-z0-9_\-:.]+)"#).expect("valid meta charset regex")
});

/// Extract the charset parameter of a Content-Type value
pub fn charset_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches(|c| c == '"' || c == '\''))
        } else {
            None
        }
    })
}

fn sniff_meta_charset(body: &[u8]) -> Option<&'static Encoding> {
    let sample = &body[..body.len().min(SNIFF_LEN)];
    let caps = META_CHARSET.captures(sample)?;
    Encoding::for_label(caps.get(1)?.as_bytes())
}

/// Return the body as UTF-8 bytes.
///
/// Detection order: byte order mark, valid UTF-8, Content-Type charset, a
/// `charset=` declaration in the first kilobyte, then GBK.
pub fn normalize_to_utf8<'a>(body: &'a [u8], content_type: &str) -> Cow<'a, [u8]> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(body) {
        let (text, _) = encoding.decode_without_bom_handling(&body[bom_len..]);
        return Cow::Owned(text.into_owned().into_bytes());
    }

    if std::str::from_utf8(body).is_ok() {
        return Cow::Borrowed(body);
    }

    let declared = charset_from_content_type(content_type)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .filter(|encoding| *encoding != UTF_8);
    let encoding = declared
        .or_else(|| sniff_meta_charset(body).filter(|encoding| *encoding != UTF_8))
        .unwrap_or(GBK);

    let (text, _) = encoding.decode_without_bom_handling(body);
    Cow::Owned(text.into_owned().into_bytes())
}

/// Whether a character is a zero-width or otherwise invisible format character
fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}')
}

/// Drop zero-width and invisible formatting characters
pub fn strip_invisible(text: &str) -> Cow<'_, str> {
    if text.chars().any(is_invisible) {
        Cow::Owned(text.chars().filter(|c| !is_invisible(*c)).collect())
    } else {
        Cow::Borrowed(text)
    }
}
