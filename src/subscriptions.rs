//! Users' subscription trees and the import merge.
//!
//! A tree is stored as JSON `{"outline":[{"title","xmlUrl","htmlUrl","outline":[...]}]}`.
//! Leaves carry an `xmlUrl`; folders carry a title and children.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Opml {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outline: Vec<Outline>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outline {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub xml_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub html_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outline: Vec<Outline>,
}

impl Outline {
    /// A leaf subscribing to one feed.
    pub fn feed(xml_url: impl Into<String>) -> Self {
        Self {
            xml_url: xml_url.into(),
            ..Self::default()
        }
    }

    /// A folder holding `children`.
    pub fn folder(title: impl Into<String>, children: Vec<Outline>) -> Self {
        Self {
            title: title.into(),
            outline: children,
            ..Self::default()
        }
    }

    pub fn is_feed(&self) -> bool {
        !self.xml_url.is_empty()
    }
}

impl Opml {
    /// Every feed URL in the tree, at any depth.
    pub fn feed_urls(&self) -> HashSet<String> {
        let mut urls = HashSet::new();
        collect_urls(&self.outline, &mut urls);
        urls
    }

    /// Merges `incoming` into the tree without duplicating any feed URL.
    ///
    /// Top-level incoming leaves are appended at top level. Leaves inside an
    /// incoming folder go into the first top-level folder with the same title,
    /// which is created when missing. Returns whether anything was added.
    pub fn merge(&mut self, incoming: Vec<Outline>) -> bool {
        let mut urls = self.feed_urls();
        let mut changed = false;

        for outline in incoming {
            if outline.is_feed() {
                changed |= self.merge_leaf(&mut urls, None, outline);
            } else {
                let label = outline.title;
                for child in outline.outline.into_iter().filter(Outline::is_feed) {
                    changed |= self.merge_leaf(&mut urls, Some(&label), child);
                }
            }
        }

        changed
    }

    fn merge_leaf(&mut self, urls: &mut HashSet<String>, label: Option<&str>, leaf: Outline) -> bool {
        if !urls.insert(leaf.xml_url.clone()) {
            return false;
        }

        match label.filter(|l| !l.is_empty()) {
            None => self.outline.push(leaf),
            Some(label) => {
                let existing = self
                    .outline
                    .iter_mut()
                    .find(|o| !o.is_feed() && o.title == label);
                match existing {
                    Some(folder) => folder.outline.push(leaf),
                    None => self.outline.push(Outline::folder(label, vec![leaf])),
                }
            }
        }
        true
    }
}

fn collect_urls(outlines: &[Outline], urls: &mut HashSet<String>) {
    for o in outlines {
        if o.is_feed() {
            urls.insert(o.xml_url.clone());
        }
        collect_urls(&o.outline, urls);
    }
}

/// Merges `incoming` into a stored tree.
///
/// Returns the new serialized tree, or `None` when nothing changed so the
/// stored bytes stay as they are.
pub fn merge_stored(
    stored: Option<&str>,
    incoming: Vec<Outline>,
) -> Result<Option<String>, serde_json::Error> {
    let mut opml: Opml = match stored {
        Some(bytes) if !bytes.trim().is_empty() => serde_json::from_str(bytes)?,
        _ => Opml::default(),
    };

    if !opml.merge(incoming) {
        return Ok(None);
    }
    serde_json::to_string(&opml).map(Some)
}
