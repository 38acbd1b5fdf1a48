use encyclo_core::db::{open_db, open_db_in_memory};
use encyclo_core::{
    AcquireOutcome, Article, ArticleStore, ContentGenerator, CreationLock, CreationLockManager,
    GenerationRequest, GeneratorError, HolderToken, InsertOutcome, LinkBriefing, ManualClock,
    QuotaTracker, ReleaseOutcome, Resolution, ResolveError, ResolverConfig, SqliteArticleStore,
    SqliteLockManager, SqliteQuotaTracker, StoreError, StoreResult, TopicResolver,
};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const T0: i64 = 1_717_200_000_000;

struct ScriptedGenerator {
    calls: AtomicUsize,
    reply: Result<String, GeneratorError>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    fn replying(body: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: Ok(body.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: GeneratorError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: Err(err),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl ContentGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        self.reply.clone()
    }
}

/// Generator whose first call blocks until the test opens the gate, while
/// tracking how many calls overlap.
struct GatedFirstCall {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    saw_cancel: AtomicBool,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GatedFirstCall {
    fn new() -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let generator = Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
            gate: Mutex::new(rx),
        });
        (generator, tx)
    }
}

impl ContentGenerator for GatedFirstCall {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if call == 0 {
            let _ = self.gate.lock().unwrap().recv();
            self.saw_cancel
                .store(request.cancel.is_cancelled(), Ordering::SeqCst);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("About {}.", request.title))
    }
}

/// Generator that sleeps through its first deadline, then answers promptly.
struct SlowFirstCall {
    calls: AtomicUsize,
    first_delay: Duration,
}

impl ContentGenerator for SlowFirstCall {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(self.first_delay);
        }
        Ok(format!("About {}.", request.title))
    }
}

fn wait_until_unlocked<S, L, Q>(resolver: &TopicResolver<S, L, Q>, topic: &str)
where
    S: ArticleStore,
    L: CreationLockManager,
    Q: QuotaTracker,
{
    let started = Instant::now();
    while resolver.pending(topic).unwrap().is_some() {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "lock for {topic:?} was never released"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

fn config(daily_limit: u32) -> ResolverConfig {
    ResolverConfig::new(daily_limit, Duration::from_secs(5), Duration::from_secs(4))
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[test]
fn creates_article_with_links_then_serves_cache_hits() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("See also [[Moon Landing]] and [[Cheese]]");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock.clone()).unwrap();

    let created = match resolver.resolve("Conspiracy").unwrap() {
        Resolution::Created(article) => article,
        other => panic!("expected created article, got {other:?}"),
    };
    assert_eq!(created.slug, "conspiracy");
    assert_eq!(created.title, "Conspiracy");
    assert_eq!(created.outgoing_links, set(&["moon-landing", "cheese"]));
    assert_eq!(created.created_at, T0);

    clock.advance(Duration::from_secs(60));
    let again = resolver.resolve("  CONSPIRACY ").unwrap();
    assert_eq!(again, Resolution::Found(created.clone()));

    assert_eq!(generator.calls(), 1);
    assert_eq!(resolver.quota_usage_today().unwrap(), 1);
    assert!(resolver.pending("Conspiracy").unwrap().is_none());

    let backlinks = resolver.incoming_links("Cheese").unwrap();
    assert_eq!(backlinks, vec![created]);
}

#[test]
fn generated_body_is_cleaned_before_persisting() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying(
        "# Giant Squid\n\nA [cephalopod](https://encyclo.example/entries/cephalopod-(mollusc)/).",
    );
    let resolver = TopicResolver::sqlite(&conn, config(10), generator, clock).unwrap();

    let resolution = resolver.resolve("Giant Squid").unwrap();
    let article = resolution.article().unwrap();
    assert_eq!(
        article.content,
        "A [cephalopod](/entries/cephalopod-(mollusc)/)."
    );
    assert_eq!(article.outgoing_links, set(&["cephalopod-(mollusc)"]));
    assert_eq!(resolution.status(), "created");
}

#[test]
fn disambiguated_topics_resolve_to_distinct_articles() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Shiny.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    let planet = resolver.resolve("Mercury (planet)").unwrap();
    let element = resolver.resolve("Mercury (element)").unwrap();

    assert_eq!(planet.article().unwrap().slug, "mercury-(planet)");
    assert_eq!(element.article().unwrap().slug, "mercury-(element)");
    assert_eq!(generator.calls(), 2);
}

#[test]
fn quota_exhaustion_releases_lock_and_resets_next_day() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Body.");
    let resolver = TopicResolver::sqlite(&conn, config(1), generator.clone(), clock.clone()).unwrap();

    assert_eq!(resolver.resolve("Apple").unwrap().status(), "created");
    assert_eq!(resolver.resolve("Banana").unwrap(), Resolution::QuotaExceeded);
    assert!(resolver.pending("Banana").unwrap().is_none());
    assert_eq!(generator.calls(), 1);

    // Cache hits stay available after the quota is spent.
    assert_eq!(resolver.resolve("apple").unwrap().status(), "found");

    clock.advance(Duration::from_secs(24 * 60 * 60));
    assert_eq!(resolver.resolve("Banana").unwrap().status(), "created");
    assert_eq!(generator.calls(), 2);
}

#[test]
fn generator_failure_persists_nothing_and_releases_lock() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::failing(GeneratorError::Upstream("503".to_string()));
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    let resolution = resolver.resolve("Cheese").unwrap();
    assert_eq!(
        resolution,
        Resolution::GenerationFailed(GeneratorError::Upstream("503".to_string()))
    );
    assert!(resolver.pending("Cheese").unwrap().is_none());

    let store = SqliteArticleStore::try_new(&conn).unwrap();
    assert!(store.get("cheese").unwrap().is_none());

    // Each attempt is charged, and the next call may try again immediately.
    assert_eq!(resolver.resolve("Cheese").unwrap().status(), "generation_failed");
    assert_eq!(generator.calls(), 2);
    assert_eq!(resolver.quota_usage_today().unwrap(), 2);
}

#[test]
fn heading_only_output_is_malformed() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("## Cheese\n");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator, clock).unwrap();

    match resolver.resolve("Cheese").unwrap() {
        Resolution::GenerationFailed(GeneratorError::Malformed(_)) => {}
        other => panic!("expected malformed output, got {other:?}"),
    }
}

#[test]
fn timed_out_generation_holds_topic_until_generator_returns() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_db(dir.path().join("timeout.db")).unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let (generator, gate) = GatedFirstCall::new();
    let config = ResolverConfig::new(10, Duration::from_secs(5), Duration::from_millis(50));
    let resolver = TopicResolver::sqlite(&conn, config, generator.clone(), clock).unwrap();

    assert_eq!(
        resolver.resolve("Slow Topic").unwrap(),
        Resolution::GenerationFailed(GeneratorError::Timeout)
    );

    // The first generation is still running, so the topic stays locked.
    assert_eq!(resolver.resolve("Slow Topic").unwrap(), Resolution::InProgress);
    assert!(resolver.pending("Slow Topic").unwrap().is_some());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    gate.send(()).unwrap();
    wait_until_unlocked(&resolver, "Slow Topic");
    assert!(generator.saw_cancel.load(Ordering::SeqCst));

    assert_eq!(resolver.resolve("Slow Topic").unwrap().status(), "created");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(generator.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn in_memory_timeout_releases_once_generator_returns() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = Arc::new(SlowFirstCall {
        calls: AtomicUsize::new(0),
        first_delay: Duration::from_millis(300),
    });
    let config = ResolverConfig::new(10, Duration::from_secs(5), Duration::from_millis(50));
    let resolver = TopicResolver::sqlite(&conn, config, generator.clone(), clock).unwrap();

    assert_eq!(
        resolver.resolve("Slow Topic").unwrap(),
        Resolution::GenerationFailed(GeneratorError::Timeout)
    );
    assert!(resolver.pending("Slow Topic").unwrap().is_none());

    assert_eq!(resolver.resolve("Slow Topic").unwrap().status(), "created");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn generator_receives_incoming_link_excerpts_and_hint() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let writer = ScriptedGenerator::replying(
        "Squid and octopuses.\nThe [[Giant Squid|kraken]] hunts at depth.\nEnd.",
    );
    let resolver = TopicResolver::sqlite(&conn, config(10), writer, clock.clone()).unwrap();
    assert_eq!(resolver.resolve("Cephalopods").unwrap().status(), "created");

    let generator = ScriptedGenerator::replying("Very large.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();
    let created = resolver
        .resolve_with_hint("Giant Squid", Some("  deep sea  "))
        .unwrap();
    assert_eq!(created.status(), "created");

    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].title, "Giant Squid");
    assert_eq!(requests[0].summary_hint.as_deref(), Some("deep sea"));
    assert_eq!(
        requests[0].link_briefings,
        vec![LinkBriefing {
            source_title: "Cephalopods".to_string(),
            anchor_text: "kraken".to_string(),
            excerpt: "Squid and octopuses.\nThe kraken hunts at depth.\nEnd.".to_string(),
        }]
    );
}

#[test]
fn blank_hint_is_not_passed_to_generator() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Body.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    resolver.resolve_with_hint("Cheese", Some("   ")).unwrap();
    let requests = generator.requests();
    assert_eq!(requests[0].summary_hint, None);
    assert!(requests[0].link_briefings.is_empty());
}

#[test]
fn slug_addressed_entry_is_titled_from_its_slug() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Very large.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    let created = resolver.resolve_slug("giant-squid").unwrap();
    let article = created.article().unwrap();
    assert_eq!(article.slug, "giant-squid");
    assert_eq!(article.title, "Giant Squid");
    assert_eq!(generator.requests()[0].title, "Giant Squid");

    assert_eq!(resolver.resolve("Giant Squid").unwrap().status(), "found");
    assert!(matches!(
        resolver.resolve_slug("--").unwrap_err(),
        ResolveError::InvalidTopic(_)
    ));
    assert_eq!(generator.calls(), 1);
}

#[test]
fn fullwidth_spelling_resolves_to_the_same_article() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Curds.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    let created = resolver.resolve("Cheese").unwrap();
    assert_eq!(
        resolver.resolve("Ｃｈｅｅｓｅ").unwrap(),
        Resolution::Found(created.article().unwrap().clone())
    );
    assert_eq!(resolver.resolve("Straße").unwrap().status(), "created");
    assert_eq!(resolver.resolve("STRASSE").unwrap().status(), "found");
    assert_eq!(generator.calls(), 2);
}

#[test]
fn stale_lock_from_crashed_holder_is_reclaimed_after_ttl() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Tentacles.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock.clone()).unwrap();

    let locks = SqliteLockManager::try_new(&conn).unwrap();
    let crashed = HolderToken::from("crashed");
    let outcome = locks
        .acquire("giant-squid", "Giant Squid", &crashed, T0, Duration::from_secs(5))
        .unwrap();
    assert!(matches!(outcome, AcquireOutcome::Acquired { .. }));

    clock.set(T0 + 4_999);
    assert_eq!(resolver.resolve("Giant Squid").unwrap(), Resolution::InProgress);
    let pending = resolver.pending("giant squid").unwrap().unwrap();
    assert_eq!(pending.holder_token, crashed);
    assert_eq!(generator.calls(), 0);

    clock.set(T0 + 5_000);
    assert_eq!(resolver.resolve("Giant Squid").unwrap().status(), "created");
    assert_eq!(generator.calls(), 1);
    assert!(locks.current("giant-squid", T0 + 5_000).unwrap().is_none());
}

#[test]
fn blank_or_symbol_only_topics_are_invalid() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Body.");
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    for topic in ["", "   ", "?!", "()"] {
        let err = resolver.resolve(topic).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidTopic(_)), "{topic:?}");
    }
    assert_eq!(generator.calls(), 0);
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Body.");
    let config = ResolverConfig::new(10, Duration::from_secs(1), Duration::from_secs(2));

    assert!(TopicResolver::sqlite(&conn, config, generator, clock).is_err());
}

#[test]
fn config_deserializes_with_defaults_for_missing_fields() {
    let config: ResolverConfig = serde_json::from_str(r#"{"daily_limit": 2}"#).unwrap();
    assert_eq!(config.daily_limit, 2);
    assert_eq!(config.lock_ttl_ms, ResolverConfig::default().lock_ttl_ms);
    assert!(config.validate().is_ok());
}

/// Lock manager that lets a rival resolver finish the article right before
/// handing out the lock.
struct RacingLocks<'conn> {
    inner: SqliteLockManager<'conn>,
    rival: SqliteArticleStore<'conn>,
    rival_article: Article,
}

impl CreationLockManager for RacingLocks<'_> {
    fn acquire(
        &self,
        topic_key: &str,
        title: &str,
        holder: &HolderToken,
        now: i64,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome> {
        self.rival.insert_if_absent(&self.rival_article)?;
        self.inner.acquire(topic_key, title, holder, now, ttl)
    }

    fn release(&self, topic_key: &str, holder: &HolderToken) -> StoreResult<ReleaseOutcome> {
        self.inner.release(topic_key, holder)
    }

    fn current(&self, topic_key: &str, now: i64) -> StoreResult<Option<CreationLock>> {
        self.inner.current(topic_key, now)
    }
}

#[test]
fn double_checked_lookup_returns_article_persisted_before_lock() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Duplicate body.");
    let rival_article = Article::new("giant-squid", "Giant Squid", "Rival body.", BTreeSet::new(), T0);

    let resolver = TopicResolver::new(
        SqliteArticleStore::try_new(&conn).unwrap(),
        RacingLocks {
            inner: SqliteLockManager::try_new(&conn).unwrap(),
            rival: SqliteArticleStore::try_new(&conn).unwrap(),
            rival_article: rival_article.clone(),
        },
        SqliteQuotaTracker::try_new(&conn).unwrap(),
        generator.clone(),
        clock,
        config(10),
    )
    .unwrap();

    assert_eq!(
        resolver.resolve("Giant Squid").unwrap(),
        Resolution::Found(rival_article)
    );
    assert_eq!(generator.calls(), 0);
    assert_eq!(resolver.quota_usage_today().unwrap(), 0);
    assert!(resolver.pending("Giant Squid").unwrap().is_none());
}

/// Generator that loses the insert race: a rival persists the article while
/// this generation is still running.
struct RivalWritingGenerator {
    db_path: PathBuf,
    calls: AtomicUsize,
}

impl ContentGenerator for RivalWritingGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let conn = open_db(&self.db_path).map_err(|err| GeneratorError::Upstream(err.to_string()))?;
        let store = SqliteArticleStore::try_new(&conn)
            .map_err(|err| GeneratorError::Upstream(err.to_string()))?;
        let rival = Article::new("giant-squid", &request.title, "Rival body.", BTreeSet::new(), T0);
        let outcome = store
            .insert_if_absent(&rival)
            .map_err(|err| GeneratorError::Upstream(err.to_string()))?;
        assert_eq!(outcome, InsertOutcome::Inserted);
        Ok("Our body, which will be discarded.".to_string())
    }
}

#[test]
fn insert_conflict_after_generation_returns_existing_article() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conflict.db");
    let conn = open_db(&path).unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = Arc::new(RivalWritingGenerator {
        db_path: path.clone(),
        calls: AtomicUsize::new(0),
    });
    let resolver = TopicResolver::sqlite(&conn, config(10), generator.clone(), clock).unwrap();

    match resolver.resolve("Giant Squid").unwrap() {
        Resolution::Found(article) => assert_eq!(article.content, "Rival body."),
        other => panic!("expected existing article, got {other:?}"),
    }
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.quota_usage_today().unwrap(), 1);

    let store = SqliteArticleStore::try_new(&conn).unwrap();
    assert_eq!(store.count().unwrap(), 1);
}

/// Lock manager whose release always fails, as if the store went away.
struct BrokenReleaseLocks<'conn> {
    inner: SqliteLockManager<'conn>,
}

impl CreationLockManager for BrokenReleaseLocks<'_> {
    fn acquire(
        &self,
        topic_key: &str,
        title: &str,
        holder: &HolderToken,
        now: i64,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome> {
        self.inner.acquire(topic_key, title, holder, now, ttl)
    }

    fn release(&self, _topic_key: &str, _holder: &HolderToken) -> StoreResult<ReleaseOutcome> {
        Err(StoreError::Db(encyclo_core::db::DbError::Sqlite(
            rusqlite::Error::InvalidQuery,
        )))
    }

    fn current(&self, topic_key: &str, now: i64) -> StoreResult<Option<CreationLock>> {
        self.inner.current(topic_key, now)
    }
}

#[test]
fn failed_release_is_surfaced_as_lock_release_error() {
    let conn: Connection = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let generator = ScriptedGenerator::replying("Body.");
    let resolver = TopicResolver::new(
        SqliteArticleStore::try_new(&conn).unwrap(),
        BrokenReleaseLocks {
            inner: SqliteLockManager::try_new(&conn).unwrap(),
        },
        SqliteQuotaTracker::try_new(&conn).unwrap(),
        generator,
        clock,
        config(10),
    )
    .unwrap();

    match resolver.resolve("Cheese").unwrap_err() {
        ResolveError::LockRelease { topic_key, .. } => assert_eq!(topic_key, "cheese"),
        other => panic!("expected lock release error, got {other}"),
    }

    // The article itself was persisted before the release failed.
    let quota = SqliteQuotaTracker::try_new(&conn).unwrap();
    assert_eq!(quota.usage(encyclo_core::clock::day_of(T0).unwrap()).unwrap(), 1);
    let store = SqliteArticleStore::try_new(&conn).unwrap();
    assert!(store.get("cheese").unwrap().is_some());
}
