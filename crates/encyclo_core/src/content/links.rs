//! Outgoing link extraction.
//!
//! # Responsibility
//! - Find references to other topics inside generated markdown.
//! - Map every reference to the canonical slug used as article key.
//!
//! # Invariants
//! - Pure: no shared state, same input always yields the same set.
//! - The returned set never contains the source article's own slug.
//!
//! Two reference forms are recognized:
//! - wiki markers: `[[Moon Landing]]`, `[[Moon Landing|the landing]]`
//! - entry links: `[text](/entries/moon-landing/)`, optionally domain-qualified

use crate::model::article::Slug;
use crate::slug::slugify;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static WIKI_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]|]+)(?:\|([^\[\]]*))?\]\]").expect("valid wiki link regex")
});
static ENTRY_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\[([^\[\]]*)\]\((?:https?://[^/\s()]+)?/entries/((?:[^\s()/#?]|\([^()\s]*\))+)/?(?:[#?][^\s()]*)?\)",
    )
    .expect("valid entry link regex")
});

/// One reference found in markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReference {
    /// Text the reader sees: the link label, or the wiki marker's label/topic.
    pub anchor_text: String,
    /// Normalized slug of the referenced topic.
    pub target: Slug,
}

/// Every reference in `text`, in source order per form; empty targets dropped.
pub fn link_references(text: &str) -> Vec<LinkReference> {
    let wiki = WIKI_LINK_RE.captures_iter(text).filter_map(|caps| {
        let topic = caps.get(1)?.as_str();
        let label = caps
            .get(2)
            .map(|label| label.as_str().trim())
            .filter(|label| !label.is_empty())
            .unwrap_or(topic);
        Some((label.trim().to_string(), topic))
    });
    let entry = ENTRY_LINK_RE.captures_iter(text).filter_map(|caps| {
        let label = caps.get(1)?.as_str().trim().to_string();
        Some((label, caps.get(2)?.as_str()))
    });

    wiki.chain(entry)
        .map(|(anchor_text, target)| LinkReference {
            anchor_text,
            target: slugify(target),
        })
        .filter(|reference| !reference.target.is_empty())
        .collect()
}

/// Extracts the set of slugs `text` refers to, excluding `self_slug`.
pub fn extract_links(text: &str, self_slug: &str) -> BTreeSet<Slug> {
    link_references(text)
        .into_iter()
        .map(|reference| reference.target)
        .filter(|slug| slug != self_slug)
        .collect()
}
