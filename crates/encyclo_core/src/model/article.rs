//! Article domain model.
//!
//! # Responsibility
//! - Define the canonical record for a finished encyclopedia entry.
//! - Keep the denormalized outgoing link set next to the content it came from.
//!
//! # Invariants
//! - `slug` is the unique key and never changes after creation.
//! - `outgoing_links` never contains `slug` itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical slug for an article or topic, e.g. `mercury-(planet)`.
///
/// Kept as a type alias to make semantic intent explicit in signatures.
pub type Slug = String;

/// Finished, persisted encyclopedia entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    /// Unique key derived from the requested topic.
    pub slug: Slug,
    /// Display title as requested by the first caller.
    pub title: String,
    /// Markdown body.
    pub content: String,
    /// Slugs referenced from `content`, computed once at creation.
    pub outgoing_links: BTreeSet<Slug>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

impl Article {
    /// Builds a new article value.
    ///
    /// Drops `slug` from `outgoing_links` if a caller passed it in.
    pub fn new(
        slug: impl Into<Slug>,
        title: impl Into<String>,
        content: impl Into<String>,
        mut outgoing_links: BTreeSet<Slug>,
        created_at: i64,
    ) -> Self {
        let slug = slug.into();
        outgoing_links.remove(&slug);
        Self {
            slug,
            title: title.into(),
            content: content.into(),
            outgoing_links,
            created_at,
        }
    }

    /// Returns whether this article references `slug`.
    pub fn links_to(&self, slug: &str) -> bool {
        self.outgoing_links.contains(slug)
    }
}
