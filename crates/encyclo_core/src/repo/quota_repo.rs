//! Daily generation quota.
//!
//! # Responsibility
//! - Count generation attempts per UTC day.
//! - Refuse attempts once the configured daily limit is reached.
//!
//! # Invariants
//! - The bound check and the increment are one statement; two racing
//!   callers can never both pass a limit that only has room for one.
//! - A day's row is created lazily by its first attempt and never deleted.
//! - `count` never decreases.

use crate::db::ensure_migrated;
use crate::repo::article_repo::{StoreError, StoreResult};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

/// Result of [`QuotaTracker::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Attempt recorded; carries the day's count including this attempt.
    Allowed(u32),
    Exhausted,
}

/// Per-day attempt counter.
pub trait QuotaTracker {
    fn try_consume(&self, day: NaiveDate, limit: u32) -> StoreResult<QuotaDecision>;
    /// Attempts recorded for `day` so far.
    fn usage(&self, day: NaiveDate) -> StoreResult<u32>;
}

/// SQLite-backed quota tracker.
pub struct SqliteQuotaTracker<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteQuotaTracker<'conn> {
    /// Creates a tracker from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_migrated(conn)?;
        Ok(Self { conn })
    }
}

impl QuotaTracker for SqliteQuotaTracker<'_> {
    fn try_consume(&self, day: NaiveDate, limit: u32) -> StoreResult<QuotaDecision> {
        if limit == 0 {
            return Ok(QuotaDecision::Exhausted);
        }

        let count = self
            .conn
            .query_row(
                "INSERT INTO daily_quota (day, count) VALUES (?1, 1)
                 ON CONFLICT(day) DO UPDATE SET count = daily_quota.count + 1
                 WHERE daily_quota.count < ?2
                 RETURNING count;",
                params![day.to_string(), limit],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        match count {
            Some(count) => Ok(QuotaDecision::Allowed(to_count(count, day)?)),
            None => Ok(QuotaDecision::Exhausted),
        }
    }

    fn usage(&self, day: NaiveDate) -> StoreResult<u32> {
        let count = self
            .conn
            .query_row(
                "SELECT count FROM daily_quota WHERE day = ?1;",
                [day.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        match count {
            Some(count) => to_count(count, day),
            None => Ok(0),
        }
    }
}

fn to_count(value: i64, day: NaiveDate) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| {
        StoreError::InvalidData(format!("invalid quota count `{value}` for {day}"))
    })
}
