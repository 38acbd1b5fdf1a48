//! Context for a new article taken from articles that already link to it.
//!
//! # Responsibility
//! - Find the lines around each reference to a target slug in linking
//!   articles and turn them into short plain-text excerpts.
//!
//! # Invariants
//! - At most [`MAX_BRIEFINGS`] briefings, each excerpt at most
//!   [`MAX_EXCERPT_CHARS`] characters before markdown is stripped.
//! - A `(source, excerpt, anchor)` triple appears at most once.
//! - The target's own article never briefs itself.

use crate::content::links::link_references;
use crate::model::article::Article;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const MAX_BRIEFINGS: usize = 5;
pub const MAX_EXCERPT_CHARS: usize = 600;
const CONTEXT_LINES: usize = 2;

static MARKDOWN_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\[\]]*)\]\((?:[^()\s]|\([^()\s]*\))*\)").expect("valid markdown link regex")
});
static WIKI_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[(?:[^\[\]|]+\|)?([^\[\]|]+)\]\]").expect("valid wiki marker regex")
});
static LINE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s{0,3}(?:>\s?|#{1,6}\s*|[-*+]\s+|\d+\.\s+)").expect("valid line prefix regex")
});
static EMPHASIS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*|__|[*`]").expect("valid emphasis regex"));
static INLINE_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("valid inline space regex"));

/// One excerpt around a reference to the topic being generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBriefing {
    /// Title of the article containing the reference.
    pub source_title: String,
    /// Visible text of the reference.
    pub anchor_text: String,
    /// Plain-text lines around the reference.
    pub excerpt: String,
}

/// Collects briefings for `target` from `sources`, in source order.
pub fn collect_link_briefings(target: &str, sources: &[Article]) -> Vec<LinkBriefing> {
    let mut briefings = Vec::new();
    let mut seen = HashSet::new();

    for article in sources.iter().filter(|article| article.slug != target) {
        let lines: Vec<&str> = article.content.lines().collect();
        for (index, line) in lines.iter().enumerate() {
            let anchors: Vec<String> = link_references(line)
                .into_iter()
                .filter(|reference| reference.target == target)
                .map(|reference| reference.anchor_text)
                .collect();
            if anchors.is_empty() {
                continue;
            }

            let start = index.saturating_sub(CONTEXT_LINES);
            let end = (index + CONTEXT_LINES + 1).min(lines.len());
            let excerpt = truncate_chars(lines[start..end].join("\n").trim(), MAX_EXCERPT_CHARS);
            let excerpt = plain_text(&excerpt);
            if excerpt.is_empty() {
                continue;
            }

            for anchor_text in anchors {
                let key = (article.slug.clone(), excerpt.clone(), anchor_text.clone());
                if !seen.insert(key) {
                    continue;
                }
                briefings.push(LinkBriefing {
                    source_title: article.title.clone(),
                    anchor_text,
                    excerpt: excerpt.clone(),
                });
                if briefings.len() >= MAX_BRIEFINGS {
                    return briefings;
                }
            }
        }
    }
    briefings
}

/// Cuts `text` to `max_chars` characters, ending with `…` when shortened.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

/// Strips common markdown so an excerpt reads as plain text.
fn plain_text(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line = LINE_PREFIX_RE.replace(line, "");
            let line = MARKDOWN_LINK_RE.replace_all(&line, "${1}");
            let line = WIKI_MARKER_RE.replace_all(&line, "${1}");
            let line = EMPHASIS_RE.replace_all(&line, "");
            INLINE_SPACE_RE.replace_all(&line, " ").trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
