//! Creation lock table: at most one in-flight generation per topic key.
//!
//! # Responsibility
//! - Grant, report and release TTL-bounded creation locks.
//! - Recover locks left behind by crashed or stuck holders.
//!
//! # Invariants
//! - Acquisition is decided by one conditional upsert: the row is written
//!   only when absent or expired (`expires_at <= now`). No separate
//!   read-then-write ever decides ownership.
//! - Release deletes the row only for the token that holds it, so a holder
//!   whose lock expired cannot free a newer holder's lock.
//! - Every acquisition also clears expired rows of other keys, so abandoned
//!   topics do not accumulate.

use crate::clock::duration_ms;
use crate::db::{ensure_migrated, open_db};
use crate::model::lock::{CreationLock, HolderToken};
use crate::repo::article_repo::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::time::Duration;

const LOCK_SELECT_SQL: &str = "SELECT
    topic_key,
    title,
    holder_token,
    acquired_at,
    expires_at
FROM creation_locks";

/// Result of [`CreationLockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Caller now holds the lock. `reclaimed` is set when an expired row
    /// from an earlier holder was replaced.
    Acquired { lock: CreationLock, reclaimed: bool },
    /// Another holder owns a live lock for this key.
    Busy,
}

/// Result of [`CreationLockManager::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No row for this key carries the caller's token (already released,
    /// or reclaimed by another holder after expiry).
    NotHeld,
}

/// A release that runs later, possibly on another thread.
pub type DeferredRelease = Box<dyn FnOnce() -> StoreResult<ReleaseOutcome> + Send>;

/// Mutex table keyed by normalized topic.
pub trait CreationLockManager {
    fn acquire(
        &self,
        topic_key: &str,
        title: &str,
        holder: &HolderToken,
        now: i64,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome>;
    fn release(&self, topic_key: &str, holder: &HolderToken) -> StoreResult<ReleaseOutcome>;
    /// Live lock for `topic_key`, if any.
    fn current(&self, topic_key: &str, now: i64) -> StoreResult<Option<CreationLock>>;
    /// Release of `holder`'s lock that can run on another thread once the
    /// current call has returned. `None` when the store cannot be reopened
    /// away from this handle.
    fn deferred_release(&self, _topic_key: &str, _holder: &HolderToken) -> Option<DeferredRelease> {
        None
    }
}

/// SQLite-backed creation lock table.
pub struct SqliteLockManager<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLockManager<'conn> {
    /// Creates a lock manager from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_migrated(conn)?;
        Ok(Self { conn })
    }
}

impl CreationLockManager for SqliteLockManager<'_> {
    fn acquire(
        &self,
        topic_key: &str,
        title: &str,
        holder: &HolderToken,
        now: i64,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome> {
        if topic_key.is_empty() {
            return Err(StoreError::InvalidInput("lock topic key is empty".to_string()));
        }
        let ttl_ms = duration_ms(ttl);
        if ttl_ms <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "lock ttl must be positive, got {ttl:?}"
            )));
        }
        let expires_at = now.saturating_add(ttl_ms);

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM creation_locks WHERE expires_at <= ?1 AND topic_key <> ?2;",
            params![now, topic_key],
        )?;
        // Only used to label the outcome; the upsert below decides ownership.
        let had_expired_row = tx
            .query_row(
                "SELECT 1 FROM creation_locks WHERE topic_key = ?1 AND expires_at <= ?2;",
                params![topic_key, now],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let written = tx.execute(
            "INSERT INTO creation_locks (topic_key, title, holder_token, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(topic_key) DO UPDATE SET
                title = excluded.title,
                holder_token = excluded.holder_token,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE creation_locks.expires_at <= excluded.acquired_at;",
            params![topic_key, title, holder.as_str(), now, expires_at],
        )?;
        tx.commit()?;

        if written == 0 {
            return Ok(AcquireOutcome::Busy);
        }

        Ok(AcquireOutcome::Acquired {
            lock: CreationLock {
                topic_key: topic_key.to_string(),
                title: title.to_string(),
                holder_token: holder.clone(),
                acquired_at: now,
                expires_at,
            },
            reclaimed: had_expired_row,
        })
    }

    fn release(&self, topic_key: &str, holder: &HolderToken) -> StoreResult<ReleaseOutcome> {
        let deleted = self.conn.execute(
            "DELETE FROM creation_locks WHERE topic_key = ?1 AND holder_token = ?2;",
            params![topic_key, holder.as_str()],
        )?;

        if deleted == 0 {
            Ok(ReleaseOutcome::NotHeld)
        } else {
            Ok(ReleaseOutcome::Released)
        }
    }

    fn current(&self, topic_key: &str, now: i64) -> StoreResult<Option<CreationLock>> {
        let lock = self
            .conn
            .query_row(
                &format!("{LOCK_SELECT_SQL} WHERE topic_key = ?1 AND expires_at > ?2;"),
                params![topic_key, now],
                parse_lock_row,
            )
            .optional()?;
        Ok(lock)
    }

    /// Reopens file databases by path; in-memory databases have no second handle.
    fn deferred_release(&self, topic_key: &str, holder: &HolderToken) -> Option<DeferredRelease> {
        let path = self.conn.path().filter(|path| !path.is_empty())?.to_string();
        let topic_key = topic_key.to_string();
        let holder = holder.clone();
        Some(Box::new(move || {
            let conn = open_db(&path)?;
            SqliteLockManager::try_new(&conn)?.release(&topic_key, &holder)
        }))
    }
}

fn parse_lock_row(row: &Row<'_>) -> rusqlite::Result<CreationLock> {
    Ok(CreationLock {
        topic_key: row.get("topic_key")?,
        title: row.get("title")?,
        holder_token: HolderToken::from(row.get::<_, String>("holder_token")?),
        acquired_at: row.get("acquired_at")?,
        expires_at: row.get("expires_at")?,
    })
}
