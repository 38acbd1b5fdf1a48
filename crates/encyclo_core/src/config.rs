//! Resolver configuration.
//!
//! # Responsibility
//! - Carry the tunables of the coordination core as one value object.
//! - Reject combinations that would break the lock protocol.
//!
//! # Invariants
//! - `lock_ttl > generator_timeout`: a holder that waits out the full
//!   generator timeout still owns its lock when it persists and releases.
//! - Missing fields fall back to [`ResolverConfig::default`].

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

const DEFAULT_DAILY_LIMIT: u32 = 100;
const DEFAULT_LOCK_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_GENERATOR_TIMEOUT_MS: u64 = 2 * 60 * 1000;

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroLockTtl,
    ZeroGeneratorTimeout,
    /// The lock could expire while its holder is still waiting on the generator.
    TtlNotAboveTimeout {
        lock_ttl_ms: u64,
        generator_timeout_ms: u64,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroLockTtl => write!(f, "lock_ttl_ms must be greater than zero"),
            Self::ZeroGeneratorTimeout => {
                write!(f, "generator_timeout_ms must be greater than zero")
            }
            Self::TtlNotAboveTimeout {
                lock_ttl_ms,
                generator_timeout_ms,
            } => write!(
                f,
                "lock_ttl_ms ({lock_ttl_ms}) must exceed generator_timeout_ms ({generator_timeout_ms})"
            ),
        }
    }
}

impl Error for ConfigError {}

/// Tunables for [`crate::TopicResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Maximum generation attempts per UTC day, across all topics.
    pub daily_limit: u32,
    /// Lifetime of a creation lock before it may be reclaimed.
    pub lock_ttl_ms: u64,
    /// Upper bound on one generator call.
    pub generator_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            generator_timeout_ms: DEFAULT_GENERATOR_TIMEOUT_MS,
        }
    }
}

impl ResolverConfig {
    pub fn new(daily_limit: u32, lock_ttl: Duration, generator_timeout: Duration) -> Self {
        Self {
            daily_limit,
            lock_ttl_ms: saturating_ms(lock_ttl),
            generator_timeout_ms: saturating_ms(generator_timeout),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_millis(self.generator_timeout_ms)
    }

    /// Checks the invariants listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl_ms == 0 {
            return Err(ConfigError::ZeroLockTtl);
        }
        if self.generator_timeout_ms == 0 {
            return Err(ConfigError::ZeroGeneratorTimeout);
        }
        if self.lock_ttl_ms <= self.generator_timeout_ms {
            return Err(ConfigError::TtlNotAboveTimeout {
                lock_ttl_ms: self.lock_ttl_ms,
                generator_timeout_ms: self.generator_timeout_ms,
            });
        }
        Ok(())
    }
}

fn saturating_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
