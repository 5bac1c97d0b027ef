//! State locking for concurrent access protection.
//!
//! A lock is a mutual-exclusion token over one state key. It is held for the
//! whole diff/plan/apply cycle and remembers the serial it expects the state
//! to be at, so a commit after the lock was lost is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Interval at which a running apply refreshes its lock.
pub const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between attempts while waiting for a contended lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Information about a state lock, as persisted next to the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

/// A held lock on a state key.
#[derive(Debug, Clone)]
pub struct StateLock {
    /// State key this lock covers.
    key: String,
    /// Lock information.
    info: LockInfo,
    /// Serial the state must be at for the next commit.
    serial: u64,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

impl StateLock {
    /// Creates a held lock for `key` expecting the state at `serial`.
    #[must_use]
    pub fn new(key: &str, info: LockInfo, serial: u64) -> Self {
        Self {
            key: key.to_string(),
            info,
            serial,
        }
    }

    /// Gets the state key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Gets the lock holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.info.holder
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Serial the state is expected to be at.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Records the serial produced by a successful commit.
    pub const fn advance(&mut self, serial: u64) {
        self.serial = serial;
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.info.is_expired()
    }

    /// Refreshes the lock.
    pub fn refresh(&mut self) {
        self.info.refresh();
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
