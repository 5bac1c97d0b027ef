//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Writers must hold the key's lock. Readers may call [`StateStore::load`]
//! without it and can then observe a document from the middle of an apply:
//! reads are eventually consistent, not linearizable.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ResourceId;
use crate::error::Result;

use super::lock::{LockInfo, StateLock};
use super::types::{StateDocument, StateUpdate};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the document for `key`, or an empty one if none exists yet.
    ///
    /// Fails with a corruption error if checksum or schema validation fails.
    async fn load(&self, key: &str) -> Result<StateDocument>;

    /// Acquires the lock on `key`, waiting up to `timeout` for another holder.
    async fn acquire_lock(&self, key: &str, holder: &str, timeout: Duration) -> Result<StateLock>;

    /// Atomically applies `updates` and bumps the serial.
    ///
    /// Fails with a stale-lock error if the lock was lost or the state moved
    /// since the lock last observed it. Returns the new serial.
    async fn commit(
        &self,
        key: &str,
        lock: &mut StateLock,
        updates: BTreeMap<ResourceId, StateUpdate>,
    ) -> Result<u64>;

    /// Pushes the expiry of a held lock forward.
    ///
    /// Fails with a stale-lock error if the lock was lost or expired.
    async fn refresh_lock(&self, lock: &mut StateLock) -> Result<()>;

    /// Releases a lock. Safe to call more than once.
    async fn release(&self, lock: &StateLock) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Removes any lock on `key` regardless of holder.
    ///
    /// Returns true if a lock was removed.
    async fn force_unlock(&self, key: &str) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, key: &str) -> Result<StateDocument> {
        (**self).load(key).await
    }

    async fn acquire_lock(&self, key: &str, holder: &str, timeout: Duration) -> Result<StateLock> {
        (**self).acquire_lock(key, holder, timeout).await
    }

    async fn commit(
        &self,
        key: &str,
        lock: &mut StateLock,
        updates: BTreeMap<ResourceId, StateUpdate>,
    ) -> Result<u64> {
        (**self).commit(key, lock, updates).await
    }

    async fn refresh_lock(&self, lock: &mut StateLock) -> Result<()> {
        (**self).refresh_lock(lock).await
    }

    async fn release(&self, lock: &StateLock) -> Result<()> {
        (**self).release(lock).await
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        (**self).lock_info(key).await
    }

    async fn force_unlock(&self, key: &str) -> Result<bool> {
        (**self).force_unlock(key).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
