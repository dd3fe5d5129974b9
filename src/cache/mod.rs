//! Cache Module
//!
//! Fingerprint-addressed artifact store with two interchangeable backends
//! (in-memory and on-disk) sharing one key, lock and metadata model.

mod disk;
mod entry;
mod key;
mod locks;
mod memory;
mod metadata;
pub mod stats;

#[cfg(test)]
mod property_tests;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncRead;

use crate::error::CacheError;

// Re-export public types
pub use disk::DiskCache;
pub use entry::{Consumed, Entry, EntryReader};
pub use key::{clean_path, CacheKey};
pub use locks::{LockShards, ShardLock, DEFAULT_SHARDS};
pub use memory::{system_memory_limit, MemoryCache};
pub use metadata::{EntryMetadata, HeaderMultiMap, ObjectInfo, Payload};
pub use stats::{CacheStats, StatsSnapshot};

/// Backend result type.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// In-place metadata edit applied under the key's write lock.
pub type MetadataMutator<'a, P> = Box<dyn FnOnce(&mut EntryMetadata<P>) + Send + 'a>;

/// Predicate re-checked under the write lock before a conditional delete.
pub type RemovalPredicate<'a, P> = &'a (dyn Fn(&EntryMetadata<P>) -> bool + Send + Sync);

/// Outcome of [`Cache::try_delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Entry removed; carries its size
    Removed(i64),
    /// Shard lock was held elsewhere
    Contended,
    /// Entry gone, or the predicate no longer holds
    Skipped,
}

// == Cache Contract ==
/// The backend-agnostic store the fetch coordinator and janitor work against.
///
/// All methods take the key's shard lock: read for lookups, write for
/// mutations. Streaming to a client happens after the lock is released.
#[async_trait]
pub trait Cache<P: Payload>: Send + Sync {
    /// Opens the entry's body and snapshots its metadata. Touches `last_access`.
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry<P>>;

    /// Metadata and staleness without opening the body.
    async fn get_metadata(&self, key: &CacheKey) -> CacheResult<(EntryMetadata<P>, bool)>;

    /// Drains `body` into a new entry. The write is atomic: on error nothing
    /// partial remains.
    async fn cache(
        &self,
        key: &CacheKey,
        body: &mut (dyn AsyncRead + Send + Unpin),
        expires: DateTime<Utc>,
        object: P,
    ) -> CacheResult<Entry<P>>;

    /// Applies `mutator` under the write lock and persists the result.
    /// `size` cannot be changed.
    async fn update_metadata(&self, key: &CacheKey, mutator: MetadataMutator<'_, P>)
        -> CacheResult<()>;

    /// Removes the entry. Returns `CacheError::Miss` if it does not exist.
    async fn delete(&self, key: &CacheKey) -> CacheResult<()>;

    /// Non-blocking delete: gives up if the shard is locked, and re-checks
    /// `predicate` under the write lock before removing.
    async fn try_delete(
        &self,
        key: &CacheKey,
        predicate: RemovalPredicate<'_, P>,
    ) -> CacheResult<Removal>;

    /// Snapshot of the key set.
    fn keys(&self) -> Vec<CacheKey>;

    /// Lazily yields `(key, metadata)` for a snapshot of the key set, re-reading
    /// each entry under its shard's read lock. Entries deleted in the meantime
    /// are skipped; entries inserted after the snapshot are not seen.
    fn iterate(&self) -> BoxStream<'_, (CacheKey, EntryMetadata<P>)> {
        stream::iter(self.keys())
            .filter_map(move |key| async move {
                self.get_metadata(&key)
                    .await
                    .ok()
                    .map(|(meta, _)| (key, meta))
            })
            .boxed()
    }

    /// Sum of entry sizes in bytes.
    fn size(&self) -> i64;

    /// Number of entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_of(&self, key: &CacheKey) -> &ShardLock;

    /// Stops the janitor and releases backend resources.
    fn destroy(&self);
}

/// The cache type the proxy runs with.
pub type SharedCache = Arc<dyn Cache<ObjectInfo>>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_iterate_skips_deleted_entries() {
        let cache: MemoryCache<ObjectInfo> =
            MemoryCache::new(1 << 20, 32, Arc::new(CacheStats::new()));
        let expires = Utc::now() + Duration::seconds(60);
        let keys: Vec<CacheKey> = (0..3)
            .map(|i| CacheKey::from_parts("http", "h", "GET", &format!("/{}", i), ""))
            .collect();
        for key in &keys {
            cache
                .cache(key, &mut &b"abc"[..], expires, ObjectInfo::default())
                .await
                .unwrap();
        }

        let mut stream = cache.iterate();
        let first = stream.next().await.unwrap();
        let remaining: Vec<CacheKey> = keys.iter().copied().filter(|k| *k != first.0).collect();
        cache.delete(&remaining[0]).await.unwrap();

        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, remaining[1]);
    }
}
