//! In-Memory Backend
//!
//! Entries are immutable `Bytes` buffers. A `get` hands out a cursor over a
//! reference-counted view of the buffer, so the bytes stay alive for as long
//! as any reader holds them, even after the entry is deleted.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::cache::{
    Cache, CacheKey, CacheResult, CacheStats, Consumed, Entry, EntryMetadata, EntryReader,
    LockShards, MetadataMutator, Payload, Removal, RemovalPredicate, ShardLock,
};
use crate::error::CacheError;
use crate::tasks::{spawn_janitor, JanitorConfig, JanitorHandle};

/// Cap used when total system memory cannot be determined.
const FALLBACK_MEMORY_LIMIT: u64 = 1 << 30;

struct MemorySlot<P> {
    data: Bytes,
    meta: Mutex<EntryMetadata<P>>,
}

// == Memory Cache ==
/// Volatile backend holding bodies in memory.
pub struct MemoryCache<P> {
    /// Live entries by key
    entries: RwLock<HashMap<CacheKey, Arc<MemorySlot<P>>>>,
    /// Per-key read/write locks
    locks: LockShards,
    /// Bytes held by live entries, reserved before an insert becomes visible
    size: AtomicI64,
    /// Upper bound for `size`
    memory_limit: u64,
    /// Shared counters
    stats: Arc<CacheStats>,
    /// Background sweeper, if started
    janitor: Mutex<Option<JanitorHandle>>,
}

impl<P: Payload> MemoryCache<P> {
    // == Constructor ==
    /// Creates an empty store.
    ///
    /// # Arguments
    /// * `memory_limit` - Inserts that would push the total past this many bytes fail
    /// * `lock_shards` - Number of per-key lock shards
    /// * `stats` - Counters shared with the proxy and the janitor
    ///
    /// # Returns
    /// A store with no janitor running; see [`MemoryCache::start_janitor`]
    pub fn new(memory_limit: u64, lock_shards: usize, stats: Arc<CacheStats>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: LockShards::new(lock_shards),
            size: AtomicI64::new(0),
            memory_limit,
            stats,
            janitor: Mutex::new(None),
        }
    }

    /// Starts the janitor for this store. Replaces any running one.
    pub fn start_janitor(self: &Arc<Self>, config: JanitorConfig) {
        let weak: Weak<dyn Cache<P>> = Arc::downgrade(self) as Weak<dyn Cache<P>>;
        let handle = spawn_janitor(weak, config, self.stats.clone());
        if let Some(previous) = self.janitor.lock().replace(handle) {
            previous.stop();
        }
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn slot(&self, key: &CacheKey) -> Option<Arc<MemorySlot<P>>> {
        self.entries.read().get(key).cloned()
    }

    fn entry_from(slot: &MemorySlot<P>, now: DateTime<Utc>, touch: bool) -> Entry<P> {
        let metadata = {
            let mut meta = slot.meta.lock();
            if touch {
                meta.touch(now);
            }
            meta.clone()
        };
        Entry {
            data: EntryReader::Memory(Cursor::new(slot.data.clone())),
            stale: metadata.is_stale_at(now),
            metadata,
        }
    }

    /// Adds `delta` bytes to the total unless that would pass the limit.
    /// Shrinking always succeeds.
    fn reserve(&self, delta: i64) -> bool {
        let limit = i64::try_from(self.memory_limit).unwrap_or(i64::MAX);
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_add(delta);
                (delta <= 0 || next <= limit).then_some(next)
            })
            .is_ok()
    }

    fn exceeded(&self, key: &CacheKey, data: Bytes) -> CacheError {
        warn!(key = %key, limit = self.memory_limit, "memory backend full");
        CacheError::MemoryExceeded {
            requested: data.len() as u64,
            limit: self.memory_limit,
        }
        .after_reading(Consumed::buffered(data))
    }

    /// Removes `key` from the map; caller holds the shard write lock.
    fn remove_locked(&self, key: &CacheKey) -> Option<i64> {
        let slot = self.entries.write().remove(key)?;
        let size = slot.meta.lock().size;
        self.size.fetch_sub(size, Ordering::AcqRel);
        self.stats.record_removed(size);
        Some(size)
    }
}

#[async_trait]
impl<P: Payload> Cache<P> for MemoryCache<P> {
    // == Get ==
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry<P>> {
        let _guard = self.lock_of(key).read().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;
        Ok(Self::entry_from(&slot, Utc::now(), true))
    }

    async fn get_metadata(&self, key: &CacheKey) -> CacheResult<(EntryMetadata<P>, bool)> {
        let _guard = self.lock_of(key).read().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;
        let meta = slot.meta.lock().clone();
        let stale = meta.is_stale();
        Ok((meta, stale))
    }

    // == Cache ==
    async fn cache(
        &self,
        key: &CacheKey,
        body: &mut (dyn AsyncRead + Send + Unpin),
        expires: DateTime<Utc>,
        object: P,
    ) -> CacheResult<Entry<P>> {
        // early bound only; the reservation below is authoritative
        let replaced = self.slot(key).map(|s| s.meta.lock().size).unwrap_or(0);
        let used = self.size.load(Ordering::Acquire) - replaced;
        let allowance = self.memory_limit.saturating_sub(used.max(0) as u64);

        // read one byte past the allowance to detect overflow without a Content-Length
        let mut buf = Vec::new();
        let read = body
            .take(allowance.saturating_add(1))
            .read_to_end(&mut buf)
            .await;
        if let Err(e) = read {
            return Err(CacheError::from(e).after_reading(Consumed::buffered(Bytes::from(buf))));
        }
        let data = Bytes::from(buf);
        if data.len() as u64 > allowance {
            return Err(self.exceeded(key, data));
        }

        let now = Utc::now();
        let size = data.len() as i64;

        let _guard = self.lock_of(key).write().await;
        let previous_size = self.slot(key).map(|p| p.meta.lock().size).unwrap_or(0);
        if !self.reserve(size - previous_size) {
            return Err(self.exceeded(key, data));
        }

        let slot = Arc::new(MemorySlot {
            data,
            meta: Mutex::new(EntryMetadata::new(now, expires, size, object)),
        });
        self.entries.write().insert(*key, slot.clone());
        self.stats.record_stored(size - previous_size);
        debug!(key = %key, size, "stored entry in memory");

        Ok(Self::entry_from(&slot, now, false))
    }

    async fn update_metadata(
        &self,
        key: &CacheKey,
        mutator: MetadataMutator<'_, P>,
    ) -> CacheResult<()> {
        let _guard = self.lock_of(key).write().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;
        let mut meta = slot.meta.lock();
        let size = meta.size;
        mutator(&mut meta);
        meta.size = size;
        Ok(())
    }

    // == Delete ==
    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let _guard = self.lock_of(key).write().await;
        self.remove_locked(key).map(|_| ()).ok_or(CacheError::Miss)
    }

    async fn try_delete(
        &self,
        key: &CacheKey,
        predicate: RemovalPredicate<'_, P>,
    ) -> CacheResult<Removal> {
        let Ok(_guard) = self.lock_of(key).try_write() else {
            return Ok(Removal::Contended);
        };
        let Some(slot) = self.slot(key) else {
            return Ok(Removal::Skipped);
        };
        if !predicate(&slot.meta.lock()) {
            return Ok(Removal::Skipped);
        }
        Ok(self
            .remove_locked(key)
            .map(Removal::Removed)
            .unwrap_or(Removal::Skipped))
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().keys().copied().collect()
    }

    fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn lock_of(&self, key: &CacheKey) -> &ShardLock {
        self.locks.lock_of(key)
    }

    fn destroy(&self) {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.stop();
        }
        let freed = self.size.swap(0, Ordering::AcqRel);
        self.entries.write().clear();
        self.stats.record_removed(freed);
    }
}

// == System Memory ==
/// `percent` of total system memory.
///
/// # Arguments
/// * `percent` - Share of physical memory, clamped to 100
///
/// # Returns
/// The cap in bytes, or 1 GiB when the total cannot be determined
pub fn system_memory_limit(percent: u8) -> u64 {
    let mut system = System::new();
    system.refresh_memory();

    match system.total_memory() {
        0 => {
            warn!(
                "could not read system memory, using {} bytes",
                FALLBACK_MEMORY_LIMIT
            );
            FALLBACK_MEMORY_LIMIT
        }
        total => total / 100 * u64::from(percent.min(100)),
    }
}
