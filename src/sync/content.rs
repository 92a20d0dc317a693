use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::storage::StoryContent;

/// Packs a story body for its content slot.
///
/// Gzip at best compression is tried first; the raw text is kept when
/// compression fails or does not save space.
pub fn pack_content(feed_url: &str, story_id: &str, body: &str) -> StoryContent {
    let compressed = gzip(body.as_bytes())
        .map_err(|e| {
            tracing::warn!(feed = %feed_url, story = %story_id, error = %e, "Story compression failed");
        })
        .ok()
        .filter(|c| c.len() < body.len());

    let raw = match compressed {
        Some(_) => None,
        None => Some(body.to_owned()),
    };

    StoryContent {
        feed_url: feed_url.to_owned(),
        story_id: story_id.to_owned(),
        compressed,
        raw,
    }
}

/// Recovers the story body from a content slot.
pub fn unpack_content(content: &StoryContent) -> std::io::Result<String> {
    match (&content.compressed, &content.raw) {
        (Some(bytes), _) => {
            let mut body = String::new();
            GzDecoder::new(bytes.as_slice()).read_to_string(&mut body)?;
            Ok(body)
        }
        (None, Some(raw)) => Ok(raw.clone()),
        (None, None) => Ok(String::new()),
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_body_is_compressed() {
        let body = "<p>hello world</p>".repeat(200);
        let content = pack_content("https://f/", "s1", &body);
        assert!(content.raw.is_none());
        assert!(content.compressed.as_ref().unwrap().len() < body.len());
        assert_eq!(unpack_content(&content).unwrap(), body);
    }

    #[test]
    fn test_tiny_body_stays_raw() {
        let content = pack_content("https://f/", "s1", "hi");
        assert_eq!(content.raw.as_deref(), Some("hi"));
        assert!(content.compressed.is_none());
        assert_eq!(unpack_content(&content).unwrap(), "hi");
    }

    #[test]
    fn test_empty_body_stays_raw() {
        let content = pack_content("https://f/", "s1", "");
        assert_eq!(content.raw.as_deref(), Some(""));
    }
}
