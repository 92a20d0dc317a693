use std::borrow::Cow;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feed_rs::model;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::Story;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The bytes are not an RSS, Atom or JSON feed
    #[error("Malformed feed: {0}")]
    Malformed(#[from] feed_rs::parser::ParseFeedError),
}

/// A feed document reduced to the fields the engine tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    /// Identity of the feed: the URL it was subscribed under
    pub url: String,
    pub title: String,
    pub link: String,
    pub hub: String,
    pub updated: Option<DateTime<Utc>>,
    /// Stories in document order, unique by id
    pub stories: Vec<ParsedStory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStory {
    pub story: Story,
    /// Body to store in the story's content slot
    pub content: String,
}

/// Parses a fetched or pushed feed document.
///
/// `orig_url` is the feed identity stories are attached to; `fetch_url` is
/// where the bytes came from and serves as base for relative links.
pub fn parse(
    content_type: &str,
    orig_url: &str,
    fetch_url: &str,
    bytes: &[u8],
) -> Result<ParsedFeed, ParseError> {
    parse_at(content_type, orig_url, fetch_url, bytes, Utc::now())
}

pub(crate) fn parse_at(
    content_type: &str,
    orig_url: &str,
    fetch_url: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<ParsedFeed, ParseError> {
    let now = truncate(now);
    let bytes = normalize_encoding(content_type, bytes);
    let feed = feed_rs::parser::Builder::new()
        .base_uri(Some(fetch_url))
        .build()
        .parse(bytes.as_ref())?;

    let hub = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("hub"))
        .map(|l| l.href.trim().to_owned())
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let stories = feed
        .entries
        .into_iter()
        .map(|entry| convert_entry(entry, orig_url, now))
        .filter(|parsed| seen.insert(parsed.story.id.clone()))
        .collect();

    Ok(ParsedFeed {
        url: orig_url.to_owned(),
        title: feed.title.map(|t| t.content.trim().to_owned()).unwrap_or_default(),
        link: primary_link(&feed.links).unwrap_or_default(),
        hub,
        updated: feed.updated.or(feed.published).map(truncate),
        stories,
    })
}

fn convert_entry(entry: model::Entry, feed_url: &str, now: DateTime<Utc>) -> ParsedStory {
    let link = primary_link(&entry.links);
    let title = entry
        .title
        .map(|t| t.content.trim().to_owned())
        .unwrap_or_default();
    let published = entry.published.or(entry.updated).map(truncate);

    let existing_id = if entry.id.is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let id = generate_guid(
        existing_id,
        link.as_deref(),
        &title,
        published.map(|p| p.timestamp()),
    );

    let summary = entry.summary.map(|s| s.content).unwrap_or_default();
    let content = entry
        .content
        .and_then(|c| c.body)
        .unwrap_or_else(|| summary.clone());
    let author = entry
        .authors
        .into_iter()
        .next()
        .map(|p| p.name)
        .unwrap_or_default();

    ParsedStory {
        story: Story {
            feed_url: feed_url.to_owned(),
            id,
            title,
            link: link.unwrap_or_default(),
            author,
            summary,
            published: published.unwrap_or(now),
            updated: entry.updated.map(truncate),
            created: now,
        },
        content,
    }
}

/// The alternate (or unlabelled) link, falling back to the first one.
fn primary_link(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_owned())
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

// ============================================================================
// Charset normalization
// ============================================================================

/// Re-encodes a document declared in a non-UTF-8 charset as UTF-8.
///
/// The Content-Type charset wins over the XML prolog. Unknown labels leave
/// the bytes untouched for the parser to try as-is.
fn normalize_encoding<'a>(content_type: &str, bytes: &'a [u8]) -> Cow<'a, [u8]> {
    let label = charset_param(content_type).or_else(|| prolog_encoding(bytes));
    let Some(encoding) = label.and_then(|l| encoding_rs::Encoding::for_label(l.as_bytes())) else {
        return Cow::Borrowed(bytes);
    };
    if encoding == encoding_rs::UTF_8 {
        return Cow::Borrowed(bytes);
    }

    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "Replaced undecodable bytes in feed");
    }
    Cow::Owned(rewrite_prolog_encoding(&decoded).into_bytes())
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_owned())
        } else {
            None
        }
    })
}

fn prolog_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(200)];
    let head = String::from_utf8_lossy(head);
    let prolog = &head[head.find("<?xml")?..];
    let prolog = &prolog[..prolog.find("?>")?];
    let start = prolog.find("encoding=")? + "encoding=".len();
    let rest = &prolog[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value = &rest[1..];
    Some(value[..value.find(quote)?].to_owned())
}

/// Points the prolog's encoding declaration at UTF-8 after transcoding.
fn rewrite_prolog_encoding(doc: &str) -> String {
    let Some(open) = doc.find("<?xml") else {
        return doc.to_owned();
    };
    let Some(close) = doc[open..].find("?>").map(|i| open + i) else {
        return doc.to_owned();
    };
    let prolog = &doc[open..close];
    let Some(attr) = prolog.find("encoding=").map(|i| open + i) else {
        return doc.to_owned();
    };

    let value_start = attr + "encoding=".len();
    let Some(quote) = doc[value_start..].chars().next().filter(|q| matches!(q, '"' | '\'')) else {
        return doc.to_owned();
    };
    let Some(value_end) = doc[value_start + 1..close]
        .find(quote)
        .map(|i| value_start + 1 + i + 1)
    else {
        return doc.to_owned();
    };

    format!("{}encoding=\"utf-8\"{}", &doc[..attr], &doc[value_end..])
}
