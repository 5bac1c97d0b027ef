//! Local file-based state storage backend.
//!
//! Each key is stored as `<key>.state.json` with a sibling `<key>.lock`.
//! Documents are written to a temporary file, synced and renamed over the
//! previous one, so a crash mid-commit leaves the last committed state
//! intact. Lock files are created with `create_new`, which makes acquisition
//! atomic across processes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResourceId;
use crate::error::{Result, StateError};

use super::envelope::{decode, encode};
use super::lock::{generate_holder_id, LockInfo, StateLock, LOCK_EXPIRY_SECS, LOCK_POLL_INTERVAL};
use super::store::StateStore;
use super::types::{StateDocument, StateUpdate};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
}

/// Outcome of one attempt to take the lock file.
enum LockAttempt {
    Acquired(LockInfo),
    Held(Option<LockInfo>),
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the state document for `key`.
    #[must_use]
    pub fn state_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.state.json"))
    }

    /// Path of the lock file for `key`.
    #[must_use]
    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.lock"))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists and parses.
    async fn read_lock_file(&self, key: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::storage(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(key, format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Tries to create the lock file exclusively.
    async fn try_lock(&self, key: &str, holder: &str) -> Result<LockAttempt> {
        self.ensure_dir().await?;
        let path = self.lock_path(key);

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // A holder that has not finished writing reads as unparseable.
                let existing = self.read_lock_file(key).await.unwrap_or(None);
                return Ok(LockAttempt::Held(existing));
            }
            Err(e) => {
                return Err(StateError::storage(format!("Failed to create lock file: {e}")).into());
            }
        };

        let lock_info = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync lock file: {e}")))?;

        Ok(LockAttempt::Acquired(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.lock_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::storage(format!("Failed to delete lock file: {e}")).into()),
        }
    }

    /// Sibling temporary file for `path`: the full file name plus `.tmp`.
    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Writes `content` to `path` through a synced temporary file and rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = Self::temp_path(path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create temp file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write temp file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync temp file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename temp file: {e}")))?;
        Ok(())
    }

    /// Pushes the expiry of `lock` forward and rewrites the lock file.
    async fn persist_refreshed(&self, lock: &mut StateLock) -> Result<()> {
        lock.refresh();
        let content = serde_json::to_string_pretty(lock.info())
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path(lock.key()), &content).await
    }

    /// Checks that `lock` still owns the lock file.
    async fn verify_lock(&self, key: &str, lock: &StateLock) -> Result<()> {
        if lock.key() != key {
            return Err(StateError::stale(
                key,
                format!("lock was acquired for '{}'", lock.key()),
            )
            .into());
        }

        match self.read_lock_file(key).await? {
            Some(info) if info.lock_id == lock.lock_id() && !info.is_expired() => Ok(()),
            Some(info) if info.lock_id == lock.lock_id() => {
                Err(StateError::stale(key, "lock expired").into())
            }
            Some(info) => Err(StateError::stale(
                key,
                format!("lock is now held by {}", info.holder),
            )
            .into()),
            None => Err(StateError::stale(key, "lock was released").into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, key: &str) -> Result<StateDocument> {
        let path = self.state_path(key);
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Ok(StateDocument::new());
        }

        debug!("Loading state from: {}", path.display());

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(key, format!("Failed to read state file: {e}")))?;

        decode(key, &content)
    }

    async fn acquire_lock(&self, key: &str, holder: &str, timeout: Duration) -> Result<StateLock> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let deadline = Instant::now() + timeout;

        loop {
            match self.try_lock(key, &holder_id).await? {
                LockAttempt::Acquired(info) => {
                    let serial = match self.load(key).await {
                        Ok(doc) => doc.serial,
                        Err(e) => {
                            // Never leave a lock behind on a failed acquisition.
                            self.delete_lock_file(key).await?;
                            return Err(e);
                        }
                    };

                    info!(
                        "Acquired state lock on {key}: {} (expires in {}s)",
                        info.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(StateLock::new(key, info, serial));
                }
                LockAttempt::Held(Some(existing)) if existing.is_expired() => {
                    warn!("Expired lock held by {} found, taking over", existing.holder);
                    self.delete_lock_file(key).await?;
                    continue;
                }
                LockAttempt::Held(existing) => {
                    if Instant::now() >= deadline {
                        let (holder, since) = existing.map_or_else(
                            || (String::from("unknown"), String::from("unknown")),
                            |info| (info.holder, info.acquired_at.to_rfc3339()),
                        );
                        return Err(StateError::LockTimeout {
                            key: key.to_string(),
                            holder,
                            since,
                            waited_secs: timeout.as_secs(),
                        }
                        .into());
                    }
                    debug!("State {key} is locked, waiting");
                }
            }

            let wait = deadline.saturating_duration_since(Instant::now()).min(LOCK_POLL_INTERVAL);
            tokio::time::sleep(wait).await;
        }
    }

    async fn commit(
        &self,
        key: &str,
        lock: &mut StateLock,
        updates: BTreeMap<ResourceId, StateUpdate>,
    ) -> Result<u64> {
        self.verify_lock(key, lock).await?;

        let mut doc = self.load(key).await?;
        if doc.serial != lock.serial() {
            return Err(StateError::stale(
                key,
                format!("expected serial {}, found {}", lock.serial(), doc.serial),
            )
            .into());
        }

        let count = updates.len();
        doc.apply_updates(updates);

        self.ensure_dir().await?;
        Self::write_atomic(&self.state_path(key), &encode(&doc)?).await?;
        lock.advance(doc.serial);
        self.persist_refreshed(lock).await?;

        debug!("Committed {count} update(s) to {key}, serial now {}", doc.serial);
        Ok(doc.serial)
    }

    async fn refresh_lock(&self, lock: &mut StateLock) -> Result<()> {
        let key = lock.key().to_string();
        self.verify_lock(&key, lock).await?;
        self.persist_refreshed(lock).await?;
        debug!("Refreshed state lock on {key}, expires {}", lock.info().expires_at);
        Ok(())
    }

    async fn release(&self, lock: &StateLock) -> Result<()> {
        let key = lock.key();
        match self.read_lock_file(key).await {
            Ok(Some(existing)) if existing.lock_id == lock.lock_id() => {
                self.delete_lock_file(key).await?;
                info!("Released state lock on {key}: {}", lock.lock_id());
            }
            Ok(Some(existing)) => {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id(),
                    existing.lock_id
                );
            }
            Ok(None) => debug!("Lock on {key} already released"),
            Err(e) => warn!("Could not read lock on {key} during release: {e}"),
        }
        Ok(())
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(key).await
    }

    async fn force_unlock(&self, key: &str) -> Result<bool> {
        let removed = self.delete_lock_file(key).await?;
        if removed {
            warn!("Force-unlocked state {key}");
        }
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
