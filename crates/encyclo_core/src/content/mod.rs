//! Pure text processing applied to generated articles.
//!
//! # Responsibility
//! - Clean generated markdown before it is stored.
//! - Derive the outgoing link set from stored markdown.
//! - Build generation context from articles that link to a topic.

pub mod briefings;
pub mod cleanup;
pub mod links;
