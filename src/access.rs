//! Access sessions: cached block reads and write-through block stores

use crate::blockstore::{BlockKey, BlockStore};
use crate::cache::{BlockCache, CacheStats};
use crate::compression::CodecSpec;
use crate::config::AccessConfig;
use crate::error::{IdxError, Result};
use crate::utils::LOCK_FILE;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a session may store blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}

/// A unit of work against a dataset.
///
/// Each session owns its own block cache. A write session holds the dataset
/// lock for its whole lifetime unless locking is disabled in the
/// [`AccessConfig`]; the lock is released by [`close`](Self::close) or when
/// the session is dropped.
pub struct AccessSession {
    store: Arc<BlockStore>,
    mode: AccessMode,
    cache: Mutex<BlockCache>,
    owner: String,
    lock_held: bool,
    closed: bool,
}

impl AccessSession {
    /// Open a session. Write mode takes the dataset lock and fails with
    /// [`IdxError::AlreadyLocked`] when another writer holds it.
    pub async fn open(store: Arc<BlockStore>, mode: AccessMode, config: &AccessConfig) -> Result<Self> {
        let owner = Uuid::new_v4().to_string();
        let mut lock_held = false;

        if mode == AccessMode::Write && !config.disable_write_lock {
            if !store.io().try_lock(LOCK_FILE, &owner).await? {
                return Err(IdxError::AlreadyLocked(LOCK_FILE.to_string()));
            }
            lock_held = true;
        }

        info!(%mode, exclusive = lock_held, session = %owner, "opened access session");
        Ok(Self {
            store,
            mode,
            cache: Mutex::new(BlockCache::new(config.cache_size_bytes())),
            owner,
            lock_held,
            closed: false,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// True while this session holds the dataset lock
    pub fn is_exclusive(&self) -> bool {
        self.lock_held
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(IdxError::InvalidState("access session is closed".to_string()));
        }
        Ok(())
    }

    /// Decoded block, or `None` when it was never written.
    pub async fn fetch(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        self.check_open()?;
        let cached = self.cache.lock().get(key);
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let data = match self.store.read_block(key).await {
            Ok(data) => Some(data),
            Err(e) if e.is_not_found() => {
                debug!(%key, "block not stored");
                None
            }
            Err(
                e @ (IdxError::Io(_)
                | IdxError::Network(_)
                | IdxError::Serialization(_)
                | IdxError::Decompression(_)),
            ) => {
                return Err(IdxError::ReadFailure(format!("{}: {}", key, e)));
            }
            Err(e) => return Err(e),
        };
        self.cache.lock().insert(*key, data.clone());
        Ok(data)
    }

    /// Write a block with its field's codec and keep it in the cache.
    pub async fn store(&self, key: &BlockKey, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.store.write_block(key, data).await?;
        self.cache.lock().insert(*key, Some(Bytes::copy_from_slice(data)));
        Ok(())
    }

    /// Write a block with an explicit codec.
    pub async fn store_with(&self, key: &BlockKey, data: &[u8], codec: &CodecSpec) -> Result<()> {
        self.check_writable()?;
        self.store.write_block_with(key, data, codec).await?;
        self.cache.lock().insert(*key, Some(Bytes::copy_from_slice(data)));
        Ok(())
    }

    /// Write a batch of blocks; containers shared by several blocks are
    /// published once. `codec` overrides the field codec.
    pub async fn store_blocks(&self, blocks: &[(BlockKey, Bytes)], codec: Option<&CodecSpec>) -> Result<()> {
        self.check_writable()?;
        self.store.write_blocks(blocks, codec).await?;
        let mut cache = self.cache.lock();
        for (key, data) in blocks {
            cache.insert(*key, Some(data.clone()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.mode != AccessMode::Write {
            return Err(IdxError::WriteError("session was opened read-only".to_string()));
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Forget cached blocks
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Release the lock and cached blocks. Further block access fails with
    /// [`IdxError::InvalidState`]; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cache.lock().clear();
        if self.lock_held {
            self.lock_held = false;
            self.store.io().unlock(LOCK_FILE)?;
        }
        info!(session = %self.owner, "closed access session");
        Ok(())
    }
}

impl Drop for AccessSession {
    fn drop(&mut self) {
        if self.lock_held {
            if let Err(e) = self.store.io().unlock(LOCK_FILE) {
                warn!(session = %self.owner, error = %e, "failed to release dataset lock");
            }
        }
    }
}

impl fmt::Debug for AccessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessSession")
            .field("mode", &self.mode)
            .field("exclusive", &self.lock_held)
            .field("closed", &self.closed)
            .finish()
    }
}
