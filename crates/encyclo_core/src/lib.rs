//! Coordination core for on-demand encyclopedia articles.
//!
//! Resolves a topic to a stored article, or generates it exactly once under a
//! per-topic creation lock and a global daily quota.

pub mod clock;
pub mod config;
pub mod content;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod slug;

pub use clock::{Clock, InstantOutOfRange, ManualClock, SystemClock};
pub use config::{ConfigError, ResolverConfig};
pub use content::briefings::{collect_link_briefings, LinkBriefing};
pub use content::cleanup::cleanup_article_body;
pub use content::links::extract_links;
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::article::{Article, Slug};
pub use model::lock::{CreationLock, HolderToken};
pub use repo::article_repo::{
    ArticleStore, InsertOutcome, SqliteArticleStore, StoreError, StoreResult,
};
pub use repo::lock_repo::{
    AcquireOutcome, CreationLockManager, DeferredRelease, ReleaseOutcome, SqliteLockManager,
};
pub use repo::quota_repo::{QuotaDecision, QuotaTracker, SqliteQuotaTracker};
pub use service::generator::{CancelToken, ContentGenerator, GenerationRequest, GeneratorError};
pub use service::resolver::{Resolution, ResolveError, ResolveResult, SetupError, TopicResolver};
pub use slug::{humanize_slug, slugify};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
