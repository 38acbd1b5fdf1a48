//! Creation lock model.
//!
//! # Invariants
//! - `expires_at = acquired_at + ttl`, and `ttl > 0`.
//! - A lock is live iff `now < expires_at`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of the request that holds a creation lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(String);

impl HolderToken {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for HolderToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HolderToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for HolderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the creation lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationLock {
    /// Normalized topic slug the lock guards.
    pub topic_key: String,
    /// Display title of the topic being generated.
    pub title: String,
    pub holder_token: HolderToken,
    /// Unix epoch milliseconds.
    pub acquired_at: i64,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
}

impl CreationLock {
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, token: &HolderToken) -> bool {
        &self.holder_token == token
    }
}
