//! Time source used by the resolver.
//!
//! The lock table and quota rows only ever see timestamps handed to them by
//! the resolver, which keeps the storage layer deterministic under test.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Epoch-millisecond instant outside the calendar range `chrono` supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstantOutOfRange(pub i64);

impl Display for InstantOutOfRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "instant {}ms is outside the supported calendar range", self.0)
    }
}

impl Error for InstantOutOfRange {}

/// Source of "now" in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    /// Calendar day (UTC) that quota usage at this instant is charged to.
    fn today(&self) -> Result<NaiveDate, InstantOutOfRange> {
        day_of(self.now_ms())
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Starts at midnight UTC of `day`.
    pub fn at_day(day: NaiveDate) -> Self {
        Self::new(day.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(duration_ms(by), Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Maps an epoch-millisecond instant to its UTC calendar day.
pub fn day_of(epoch_ms: i64) -> Result<NaiveDate, InstantOutOfRange> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.date_naive())
        .ok_or(InstantOutOfRange(epoch_ms))
}

/// Saturating conversion used wherever a `Duration` meets an epoch-ms column.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
