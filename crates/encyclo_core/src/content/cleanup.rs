//! Normalization of generated article bodies before they are persisted.
//!
//! # Invariants
//! - The first markdown heading is dropped; titles are rendered separately.
//! - `/entries/` links never keep a scheme or host.

use once_cell::sync::Lazy;
use regex::Regex;

static LEADING_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#{1,6}\s+.*?(?:\n|$)").expect("valid heading regex"));
static QUALIFIED_ENTRY_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\[[^\]]+\]\()https?://[^)\s]*?(/entries/(?:[^\s()]+|\([^)]*\))+)(\))")
        .expect("valid qualified entry link regex")
});
static BARE_ENTRY_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s)]+(/entries/(?:[^\s()\]]+|\([^)]*\))+)")
        .expect("valid bare entry link regex")
});

/// Removes a leading H1-H6 heading, if the body starts with one.
pub fn strip_leading_heading(text: &str) -> String {
    let trimmed = text.trim();
    LEADING_HEADING_RE.replace(trimmed, "").trim().to_string()
}

/// Rewrites domain-qualified `/entries/` URLs to site-relative ones.
pub fn cleanup_internal_links(text: &str) -> String {
    let relative = QUALIFIED_ENTRY_LINK_RE.replace_all(text, "${1}${2}${3}");
    BARE_ENTRY_LINK_RE
        .replace_all(&relative, "${1}")
        .into_owned()
}

/// Applies every cleanup step to a generated body.
pub fn cleanup_article_body(text: &str) -> String {
    cleanup_internal_links(&strip_leading_heading(text))
}
