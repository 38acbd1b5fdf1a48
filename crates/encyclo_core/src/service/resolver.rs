//! Topic resolution: serve a stored article or generate it exactly once.
//!
//! # Responsibility
//! - Turn a raw topic into a stored article, or into an explicit status when
//!   that is not possible right now.
//! - Tie the article store, creation lock table, quota tracker and content
//!   generator together.
//!
//! # Invariants
//! - A store hit never touches the lock table, the quota or the generator.
//! - At most one generation per topic key is in flight system-wide.
//! - Quota is charged once per generator invocation, after the lock is held
//!   and the double-checked lookup missed.
//! - Every path that acquired the lock releases it; a failed release is
//!   reported, never swallowed.
//! - A generator that outlived its deadline keeps the topic locked until it
//!   stops: the release is handed to its worker thread, or waited for up to
//!   the lock's own expiry.
//! - No partial article is ever persisted.

use crate::clock::{Clock, InstantOutOfRange};
use crate::config::{ConfigError, ResolverConfig};
use crate::content::briefings::collect_link_briefings;
use crate::content::cleanup::cleanup_article_body;
use crate::content::links::extract_links;
use crate::model::article::Article;
use crate::model::lock::{CreationLock, HolderToken};
use crate::repo::article_repo::{
    ArticleStore, InsertOutcome, SqliteArticleStore, StoreError, StoreResult,
};
use crate::repo::lock_repo::{
    AcquireOutcome, CreationLockManager, ReleaseOutcome, SqliteLockManager,
};
use crate::repo::quota_repo::{QuotaDecision, QuotaTracker, SqliteQuotaTracker};
use crate::service::generator::{
    run_with_deadline, AbandonedWorker, ContentGenerator, Deadline, GenerationRequest,
    GeneratorError,
};
use crate::slug::{humanize_slug, slugify};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`TopicResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Article already existed (including one persisted by a concurrent
    /// resolver while this call was in flight).
    Found(Article),
    /// Article was generated and persisted by this call.
    Created(Article),
    /// Another resolver is generating this topic; retry later.
    InProgress,
    /// Daily generation quota is used up; retry tomorrow.
    QuotaExceeded,
    /// Generator failed; nothing was persisted.
    GenerationFailed(GeneratorError),
}

impl Resolution {
    pub fn article(&self) -> Option<&Article> {
        match self {
            Self::Found(article) | Self::Created(article) => Some(article),
            _ => None,
        }
    }

    /// Status label for callers that map outcomes to responses.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Found(_) => "found",
            Self::Created(_) => "created",
            Self::InProgress => "in_progress",
            Self::QuotaExceeded => "quota_exceeded",
            Self::GenerationFailed(_) => "generation_failed",
        }
    }
}

/// Fatal resolver failures. Expected outcomes live in [`Resolution`].
#[derive(Debug)]
pub enum ResolveError {
    /// Topic is blank or normalizes to an empty slug.
    InvalidTopic(String),
    Store(StoreError),
    /// Clock reported an instant with no calendar day.
    Clock(InstantOutOfRange),
    /// Lock could not be released; the topic stays blocked until TTL expiry.
    LockRelease {
        topic_key: String,
        source: StoreError,
    },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTopic(topic) => write!(f, "invalid topic `{topic}`"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Clock(err) => write!(f, "{err}"),
            Self::LockRelease { topic_key, source } => {
                write!(f, "failed to release creation lock for `{topic_key}`: {source}")
            }
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidTopic(_) => None,
            Self::Store(err) => Some(err),
            Self::Clock(err) => Some(err),
            Self::LockRelease { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<InstantOutOfRange> for ResolveError {
    fn from(value: InstantOutOfRange) -> Self {
        Self::Clock(value)
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Orchestrates lookup, locking, quota and generation for one topic.
///
/// Holds no state across calls beyond its collaborators; one instance per
/// connection/thread.
pub struct TopicResolver<S, L, Q> {
    articles: S,
    locks: L,
    quota: Q,
    generator: Arc<dyn ContentGenerator>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
}

impl<'conn>
    TopicResolver<SqliteArticleStore<'conn>, SqliteLockManager<'conn>, SqliteQuotaTracker<'conn>>
{
    /// Builds a resolver whose stores all share one migrated connection.
    pub fn sqlite(
        conn: &'conn Connection,
        config: ResolverConfig,
        generator: Arc<dyn ContentGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SetupError> {
        Ok(Self::new(
            SqliteArticleStore::try_new(conn)?,
            SqliteLockManager::try_new(conn)?,
            SqliteQuotaTracker::try_new(conn)?,
            generator,
            clock,
            config,
        )?)
    }
}

impl<S, L, Q> TopicResolver<S, L, Q>
where
    S: ArticleStore,
    L: CreationLockManager,
    Q: QuotaTracker,
{
    /// Creates a resolver after validating `config`.
    pub fn new(
        articles: S,
        locks: L,
        quota: Q,
        generator: Arc<dyn ContentGenerator>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            articles,
            locks,
            quota,
            generator,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves `raw_topic` to an article or a retry/terminal status.
    pub fn resolve(&self, raw_topic: &str) -> ResolveResult<Resolution> {
        self.resolve_with_hint(raw_topic, None)
    }

    /// Like [`resolve`](Self::resolve); a non-blank `summary_hint` is passed to
    /// the generator when a new article has to be written.
    pub fn resolve_with_hint(
        &self,
        raw_topic: &str,
        summary_hint: Option<&str>,
    ) -> ResolveResult<Resolution> {
        let (title, topic_key) = normalize_topic(raw_topic)?;
        let summary_hint = summary_hint.map(str::trim).filter(|hint| !hint.is_empty());
        self.resolve_key(title, topic_key, summary_hint)
    }

    /// Resolves an entry addressed by slug, e.g. from an `/entries/<slug>/`
    /// link. A new article is titled from the slug (`giant-squid` ->
    /// `Giant Squid`).
    pub fn resolve_slug(&self, slug: &str) -> ResolveResult<Resolution> {
        let topic_key = slugify(slug);
        if topic_key.is_empty() {
            return Err(ResolveError::InvalidTopic(slug.to_string()));
        }
        let title = humanize_slug(&topic_key);
        self.resolve_key(&title, topic_key, None)
    }

    fn resolve_key(
        &self,
        title: &str,
        topic_key: String,
        summary_hint: Option<&str>,
    ) -> ResolveResult<Resolution> {
        if let Some(article) = self.articles.get(&topic_key)? {
            debug!("event=resolve_hit module=resolver status=ok topic_key={topic_key}");
            return Ok(Resolution::Found(article));
        }

        let holder = HolderToken::generate();
        let acquired = self.locks.acquire(
            &topic_key,
            title,
            &holder,
            self.clock.now_ms(),
            self.config.lock_ttl(),
        )?;

        let expires_at = match acquired {
            AcquireOutcome::Busy => {
                info!("event=lock_busy module=resolver status=busy topic_key={topic_key}");
                return Ok(Resolution::InProgress);
            }
            AcquireOutcome::Acquired { lock, reclaimed } => {
                if reclaimed {
                    warn!(
                        "event=lock_reclaimed module=resolver status=ok topic_key={} expires_at={}",
                        lock.topic_key, lock.expires_at
                    );
                } else {
                    info!(
                        "event=lock_acquired module=resolver status=ok topic_key={} expires_at={}",
                        lock.topic_key, lock.expires_at
                    );
                }
                lock.expires_at
            }
        };

        let guard = LockGuard::new(&self.locks, &topic_key, holder);
        let outcome = match self.resolve_locked(&topic_key, title, summary_hint) {
            Ok(Locked::Settled(resolution)) => Ok(resolution),
            Ok(Locked::Abandoned(worker)) => {
                let remaining = expires_at.saturating_sub(self.clock.now_ms()).max(0);
                let remaining = Duration::from_millis(remaining.unsigned_abs());
                return match guard.hand_off(worker, remaining) {
                    Ok(()) => Ok(Resolution::GenerationFailed(GeneratorError::Timeout)),
                    Err(source) => Err(ResolveError::LockRelease { topic_key, source }),
                };
            }
            Err(err) => Err(err),
        };
        let released = guard.release();

        match (outcome, released) {
            (Ok(resolution), Ok(())) => Ok(resolution),
            (Ok(_), Err(source)) => Err(ResolveError::LockRelease { topic_key, source }),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(source)) => {
                error!(
                    "event=lock_release_failed module=resolver status=error topic_key={topic_key} error={source}"
                );
                Err(err)
            }
        }
    }

    /// Live creation lock for `raw_topic`, if generation is in progress.
    pub fn pending(&self, raw_topic: &str) -> ResolveResult<Option<CreationLock>> {
        let (_, topic_key) = normalize_topic(raw_topic)?;
        Ok(self.locks.current(&topic_key, self.clock.now_ms())?)
    }

    /// Articles linking to `slug`, ordered by title.
    pub fn incoming_links(&self, slug: &str) -> ResolveResult<Vec<Article>> {
        Ok(self.articles.linking_to(&slugify(slug))?)
    }

    /// Generation attempts recorded for the current day.
    pub fn quota_usage_today(&self) -> ResolveResult<u32> {
        Ok(self.quota.usage(self.clock.today()?)?)
    }

    /// Steps that run while this call holds the creation lock.
    fn resolve_locked(
        &self,
        topic_key: &str,
        title: &str,
        summary_hint: Option<&str>,
    ) -> ResolveResult<Locked> {
        // A concurrent resolver may have persisted between our miss and acquisition.
        if let Some(article) = self.articles.get(topic_key)? {
            debug!("event=resolve_hit module=resolver status=ok stage=locked topic_key={topic_key}");
            return Ok(Locked::Settled(Resolution::Found(article)));
        }

        let day = self.clock.today()?;
        match self.quota.try_consume(day, self.config.daily_limit)? {
            QuotaDecision::Exhausted => {
                warn!(
                    "event=quota_exhausted module=resolver status=rejected topic_key={topic_key} day={day} limit={}",
                    self.config.daily_limit
                );
                return Ok(Locked::Settled(Resolution::QuotaExceeded));
            }
            QuotaDecision::Allowed(count) => {
                debug!(
                    "event=quota_consumed module=resolver status=ok day={day} count={count} limit={}",
                    self.config.daily_limit
                );
            }
        }

        let link_briefings = collect_link_briefings(topic_key, &self.articles.linking_to(topic_key)?);
        debug!(
            "event=generation_started module=resolver status=ok topic_key={topic_key} briefings={} summary_hint={}",
            link_briefings.len(),
            summary_hint.is_some()
        );
        let request = GenerationRequest::new(title, self.config.generator_timeout())
            .with_summary_hint(summary_hint.map(str::to_string))
            .with_link_briefings(link_briefings);

        let generated = match run_with_deadline(&self.generator, request) {
            Deadline::Finished(result) => result,
            Deadline::Expired(worker) => {
                warn!(
                    "event=generation_failed module=resolver status=error topic_key={topic_key} error_code=timeout"
                );
                return Ok(Locked::Abandoned(worker));
            }
        };
        let body = match generated.and_then(|raw| clean_body(&raw)) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    "event=generation_failed module=resolver status=error topic_key={topic_key} error_code={} error={err}",
                    err.code()
                );
                return Ok(Locked::Settled(Resolution::GenerationFailed(err)));
            }
        };

        let outgoing_links = extract_links(&body, topic_key);
        let article = Article::new(topic_key, title, body, outgoing_links, self.clock.now_ms());

        match self.articles.insert_if_absent(&article)? {
            InsertOutcome::Inserted => {
                info!(
                    "event=article_created module=resolver status=ok topic_key={topic_key} links={}",
                    article.outgoing_links.len()
                );
                Ok(Locked::Settled(Resolution::Created(article)))
            }
            InsertOutcome::AlreadyExists => {
                warn!(
                    "event=article_conflict module=resolver status=discarded topic_key={topic_key}"
                );
                let existing = self.articles.get(topic_key)?.ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "article `{topic_key}` reported as existing but not found"
                    ))
                })?;
                Ok(Locked::Settled(Resolution::Found(existing)))
            }
        }
    }
}

/// What the locked section left for the caller to finish.
enum Locked {
    Settled(Resolution),
    /// Generator timed out and is still running; release is not yet safe.
    Abandoned(AbandonedWorker),
}

fn clean_body(raw: &str) -> Result<String, GeneratorError> {
    let body = cleanup_article_body(raw);
    if body.is_empty() {
        return Err(GeneratorError::Malformed("empty article body".to_string()));
    }
    Ok(body)
}

/// Errors from [`TopicResolver::sqlite`].
#[derive(Debug)]
pub enum SetupError {
    Store(StoreError),
    Config(ConfigError),
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Config(err) => Some(err),
        }
    }
}

impl From<StoreError> for SetupError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ConfigError> for SetupError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Releases a held creation lock exactly once.
///
/// [`LockGuard::release`] reports the store result; dropping an unreleased
/// guard (unwinding) still attempts the release and logs a failure.
struct LockGuard<'a, L: CreationLockManager> {
    locks: &'a L,
    topic_key: &'a str,
    holder: Option<HolderToken>,
}

impl<'a, L: CreationLockManager> LockGuard<'a, L> {
    fn new(locks: &'a L, topic_key: &'a str, holder: HolderToken) -> Self {
        Self {
            locks,
            topic_key,
            holder: Some(holder),
        }
    }

    fn release(mut self) -> StoreResult<()> {
        match self.holder.take() {
            Some(holder) => release_lock(self.locks, self.topic_key, &holder),
            None => Ok(()),
        }
    }

    /// Releases once the abandoned generator stops.
    ///
    /// Stores that can reopen themselves release from the worker thread when
    /// the generator returns. Otherwise this waits for the worker, at most
    /// `lock_remaining`, and releases here; a worker still running after that
    /// is left to the TTL.
    fn hand_off(mut self, worker: AbandonedWorker, lock_remaining: Duration) -> StoreResult<()> {
        let Some(holder) = self.holder.take() else {
            return Ok(());
        };

        if let Some(release) = self.locks.deferred_release(self.topic_key, &holder) {
            let topic_key = self.topic_key.to_string();
            let deferred =
                worker.on_exit(Box::new(move || log_deferred_release(&topic_key, release())));
            if deferred {
                info!(
                    "event=lock_handed_off module=resolver status=ok topic_key={}",
                    self.topic_key
                );
            }
            return Ok(());
        }

        if worker.wait_for_exit(lock_remaining) {
            return release_lock(self.locks, self.topic_key, &holder);
        }
        warn!(
            "event=lock_left_to_ttl module=resolver status=timeout topic_key={}",
            self.topic_key
        );
        Ok(())
    }
}

impl<L: CreationLockManager> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            if let Err(err) = release_lock(self.locks, self.topic_key, &holder) {
                error!(
                    "event=lock_release_failed module=resolver status=error stage=unwind topic_key={} error={err}",
                    self.topic_key
                );
            }
        }
    }
}

fn release_lock<L: CreationLockManager>(
    locks: &L,
    topic_key: &str,
    holder: &HolderToken,
) -> StoreResult<()> {
    match locks.release(topic_key, holder)? {
        ReleaseOutcome::Released => {
            debug!("event=lock_released module=resolver status=ok topic_key={topic_key}");
        }
        ReleaseOutcome::NotHeld => {
            warn!("event=lock_lost module=resolver status=expired topic_key={topic_key}");
        }
    }
    Ok(())
}

fn log_deferred_release(topic_key: &str, released: StoreResult<ReleaseOutcome>) {
    match released {
        Ok(ReleaseOutcome::Released) => {
            info!("event=lock_released module=resolver status=ok stage=deferred topic_key={topic_key}");
        }
        Ok(ReleaseOutcome::NotHeld) => {
            warn!("event=lock_lost module=resolver status=expired stage=deferred topic_key={topic_key}");
        }
        Err(err) => {
            error!(
                "event=lock_release_failed module=resolver status=error stage=deferred topic_key={topic_key} error={err}"
            );
        }
    }
}

fn normalize_topic(raw_topic: &str) -> ResolveResult<(&str, String)> {
    let title = raw_topic.trim();
    let topic_key = slugify(title);
    if topic_key.is_empty() {
        return Err(ResolveError::InvalidTopic(raw_topic.to_string()));
    }
    Ok((title, topic_key))
}
