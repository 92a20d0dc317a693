use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::util::normalize_feed_url;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

impl From<quick_xml::Error> for OpmlError {
    fn from(e: quick_xml::Error) -> Self {
        OpmlError::XmlParse(e.to_string())
    }
}

/// A feed subscription extracted from an OPML document.
#[derive(Debug, Clone, PartialEq)]
pub struct OpmlFeed {
    /// Title of the top-level folder holding this feed, `None` at top level
    pub folder: Option<String>,
    /// Display title, falling back to `text`; empty when the outline has neither
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
}

/// Extracts every feed outline of an OPML document in document order.
///
/// Folder outlines (no `xmlUrl`) are traversed. A feed nested at any depth
/// is labelled with its top-level folder. Outlines with unusable URLs are
/// skipped with a warning.
///
/// quick-xml 0.37 never expands `<!ENTITY>` declarations, so custom
/// entities fail to unescape instead of resolving.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    // One entry per open <outline>: the folder label it establishes, if any
    let mut open: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                let label = match outline.xml_url {
                    Some(_) => None,
                    None => outline.title.clone(),
                };
                push_feed(&mut feeds, outline, &open);
                open.push(label);
            }
            Event::Empty(e) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                push_feed(&mut feeds, outline, &open);
            }
            Event::End(e) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(feeds)
}

struct RawOutline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

fn push_feed(feeds: &mut Vec<OpmlFeed>, outline: RawOutline, open: &[Option<String>]) {
    let Some(raw_url) = outline.xml_url else {
        return;
    };
    let xml_url = match normalize_feed_url(&raw_url) {
        Ok(url) => url.to_string(),
        Err(e) => {
            tracing::warn!(url = %raw_url, error = %e, "Skipping invalid feed URL in OPML");
            return;
        }
    };

    // Only the outermost folder counts
    let folder = open.first().cloned().flatten();
    feeds.push(OpmlFeed {
        folder,
        title: outline.title.unwrap_or_default(),
        xml_url,
        html_url: outline.html_url.filter(|u| !u.trim().is_empty()),
    });
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<RawOutline, OpmlError> {
    let mut outline = RawOutline {
        title: None,
        xml_url: None,
        html_url: None,
    };
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || -> Result<String, OpmlError> {
            Ok(attr.decode_and_unescape_value(reader.decoder())?.into_owned())
        };
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value()?),
            b"htmlUrl" => outline.html_url = Some(value()?),
            b"title" => outline.title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    outline.title = outline.title.or(text).filter(|t| !t.trim().is_empty());
    Ok(outline)
}
