//! Feed autodiscovery in HTML documents.
//!
//! Looks for `<link rel="alternate">` tags with an RSS/Atom type using plain
//! string scanning, so no HTML parser is needed.

/// Whether a response should be scanned for an autodiscovery link instead of
/// being parsed as a feed.
pub(crate) fn looks_like_html(content_type: &str, bytes: &[u8]) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("text/html") || content_type.contains("application/xhtml") {
        return true;
    }
    if content_type.contains("xml") {
        return false;
    }

    // Missing or generic type: sniff the start of the body
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Returns the first RSS/Atom alternate link in `html`, resolved against
/// `base_url`.
pub(crate) fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    // ASCII lowering keeps byte offsets aligned with `html`
    let html_lower = html.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        let tag = &remaining[..=tag_end];

        if contains_attr(tag, "rel", "alternate") && is_feed_type(tag) {
            // Take href from the original text to preserve URL case
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(href) = extract_attr_value(original_tag, "href") {
                return Some(resolve_url(href.trim(), base_url));
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

fn is_feed_type(tag: &str) -> bool {
    tag.contains("application/rss+xml") || tag.contains("application/atom+xml")
}

/// Extracts a quoted attribute value from a tag (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!("{attr_name}=");

    let attr_start = tag_lower.find(&attr_prefix)?;
    let value_start = attr_start + attr_prefix.len();

    if value_start >= tag.len() {
        return None;
    }

    let rest = &tag[value_start..];
    let quote = rest.as_bytes().first()?;

    if *quote != b'"' && *quote != b'\'' {
        return None;
    }

    let quote_char = *quote as char;
    let inner = &rest[1..];
    let end = inner.find(quote_char)?;

    Some(&inner[..end])
}

/// Resolves a potentially relative URL against a base URL.
pub(crate) fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }

    // Relative and protocol-relative references take the base's scheme
    if let Ok(base) = url::Url::parse(base_url) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }

    href.to_owned()
}
