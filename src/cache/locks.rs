//! Shard Lock Table
//!
//! A fixed array of read/write locks. A key maps to the lock at
//! `prefix_u32(key) mod S`, so there is no per-key allocation.

use tokio::sync::RwLock;

use crate::cache::CacheKey;

/// Lock guarding one shard of the key space.
pub type ShardLock = RwLock<()>;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 1024;

#[derive(Debug)]
pub struct LockShards {
    locks: Box<[ShardLock]>,
    mask: usize,
}

impl LockShards {
    /// Creates `shards` locks. The count is rounded up to a power of two.
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        let locks = (0..shards).map(|_| RwLock::new(())).collect::<Vec<_>>();
        Self {
            locks: locks.into_boxed_slice(),
            mask: shards - 1,
        }
    }

    /// The lock responsible for `key`.
    pub fn lock_of(&self, key: &CacheKey) -> &ShardLock {
        &self.locks[key.prefix_u32() as usize & self.mask]
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for LockShards {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
