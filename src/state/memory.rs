//! In-memory state storage backend.
//!
//! Process-local and lost on exit. Used by tests and by `--backend memory`
//! dry runs. Documents still pass through the checksummed envelope so the
//! two backends share one persisted representation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResourceId;
use crate::error::{Result, StateError};

use super::envelope::{decode, encode};
use super::lock::{generate_holder_id, LockInfo, StateLock, LOCK_POLL_INTERVAL};
use super::store::StateStore;
use super::types::{StateDocument, StateUpdate};

#[derive(Debug, Default)]
struct Slot {
    /// Encoded document, if anything was committed.
    document: Option<String>,
    /// Current lock holder.
    lock: Option<LockInfo>,
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slots: Mutex<HashMap<String, Slot>>,
    released: Notify,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `key` if `lock` still holds it.
    fn held_slot<'s>(
        slots: &'s mut HashMap<String, Slot>,
        key: &str,
        lock: &StateLock,
    ) -> Result<&'s mut Slot> {
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| StateError::stale(key, "lock was released"))?;

        let lost = match &slot.lock {
            Some(info) if info.lock_id == lock.lock_id() && !info.is_expired() => None,
            Some(info) if info.lock_id == lock.lock_id() => Some(String::from("lock expired")),
            Some(info) => Some(format!("lock is now held by {}", info.holder)),
            None => Some(String::from("lock was released")),
        };

        match lost {
            None => Ok(slot),
            Some(reason) => Err(StateError::stale(key, reason).into()),
        }
    }

    fn load_slot(key: &str, slot: Option<&Slot>) -> Result<StateDocument> {
        match slot.and_then(|s| s.document.as_deref()) {
            Some(content) => decode(key, content),
            None => Ok(StateDocument::new()),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<StateDocument> {
        let slots = self.slots.lock().await;
        Self::load_slot(key, slots.get(key))
    }

    async fn acquire_lock(&self, key: &str, holder: &str, timeout: Duration) -> Result<StateLock> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let deadline = Instant::now() + timeout;

        loop {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(key.to_string()).or_default();

            let held = slot.lock.as_ref().filter(|info| !info.is_expired()).cloned();
            let Some(existing) = held else {
                let info = LockInfo::new(&holder_id);
                let serial = Self::load_slot(key, Some(&*slot))?.serial;
                slot.lock = Some(info.clone());
                info!("Acquired state lock on {key}: {}", info.lock_id);
                return Ok(StateLock::new(key, info, serial));
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(StateError::LockTimeout {
                    key: key.to_string(),
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                    waited_secs: timeout.as_secs(),
                }
                .into());
            }

            // Register before dropping the guard so a release in between is not missed.
            let notified = self.released.notified();
            drop(slots);
            debug!("State {key} is locked by {}, waiting", existing.holder);

            let wait = deadline.saturating_duration_since(now).min(LOCK_POLL_INTERVAL * 10);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn commit(
        &self,
        key: &str,
        lock: &mut StateLock,
        updates: BTreeMap<ResourceId, StateUpdate>,
    ) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let slot = Self::held_slot(&mut slots, key, lock)?;

        let mut doc = Self::load_slot(key, Some(&*slot))?;
        if doc.serial != lock.serial() {
            return Err(StateError::stale(
                key,
                format!("expected serial {}, found {}", lock.serial(), doc.serial),
            )
            .into());
        }

        doc.apply_updates(updates);
        slot.document = Some(encode(&doc)?);

        lock.advance(doc.serial);
        lock.refresh();
        slot.lock = Some(lock.info().clone());

        Ok(doc.serial)
    }

    async fn refresh_lock(&self, lock: &mut StateLock) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let key = lock.key().to_string();
        let slot = Self::held_slot(&mut slots, &key, lock)?;

        lock.refresh();
        slot.lock = Some(lock.info().clone());
        debug!("Refreshed state lock on {key}");
        Ok(())
    }

    async fn release(&self, lock: &StateLock) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(lock.key())
            && slot.lock.as_ref().is_some_and(|info| info.lock_id == lock.lock_id())
        {
            slot.lock = None;
            info!("Released state lock on {}: {}", lock.key(), lock.lock_id());
        }
        drop(slots);

        self.released.notify_waiters();
        Ok(())
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        let slots = self.slots.lock().await;
        Ok(slots.get(key).and_then(|s| s.lock.clone()))
    }

    async fn force_unlock(&self, key: &str) -> Result<bool> {
        let mut slots = self.slots.lock().await;
        let removed = slots.get_mut(key).and_then(|s| s.lock.take()).is_some();
        drop(slots);

        if removed {
            warn!("Force-unlocked state {key}");
            self.released.notify_waiters();
        }
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
