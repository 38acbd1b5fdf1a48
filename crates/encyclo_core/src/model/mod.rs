//! Domain model for articles and the coordination tables around them.
//!
//! # Responsibility
//! - Define canonical data structures used by the store and resolver.
//!
//! # Invariants
//! - Every article is identified by a stable slug.
//! - Timestamps are Unix epoch milliseconds; quota days are UTC dates.

pub mod article;
pub mod lock;
