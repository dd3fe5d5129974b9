//! Cache Statistics Module
//!
//! Lock-free counters mirrored by the cache core. Every update is an atomic
//! add; readers take a point-in-time [`StatsSnapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::http::HitStatus;

// == Cache Stats ==
/// Counters and gauges for the cache core.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    revalidated: AtomicU64,
    stored: AtomicU64,
    bytes_cached: AtomicI64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    upstream_requests: AtomicU64,
    bytes_served: AtomicU64,
    coalesced: AtomicU64,
    coalesced_hits: AtomicU64,
    coalesced_misses: AtomicU64,
    coalesced_revalidated: AtomicU64,
    non_coalesced: AtomicU64,
}

/// Serializable copy of [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub revalidated: u64,
    pub stored: u64,
    pub bytes_cached: i64,
    pub expirations: u64,
    pub evictions: u64,
    pub upstream_requests: u64,
    pub bytes_served: u64,
    pub coalesced: u64,
    pub coalesced_hits: u64,
    pub coalesced_misses: u64,
    pub coalesced_revalidated: u64,
    pub non_coalesced: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Record Outcome ==
    /// Counts the cache outcome of one request.
    pub fn record_outcome(&self, status: HitStatus) {
        let counter = match status {
            HitStatus::Hit => &self.hits,
            HitStatus::Revalidated => &self.revalidated,
            HitStatus::Miss => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // == Coalescing ==
    /// Counts a follower that received a leader's result.
    pub fn record_coalesced(&self, status: HitStatus) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            HitStatus::Hit => &self.coalesced_hits,
            HitStatus::Revalidated => &self.coalesced_revalidated,
            HitStatus::Miss => &self.coalesced_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_non_coalesced(&self) {
        self.non_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    // == Backend Bookkeeping ==
    /// Mirrors a successful insert of `bytes` (net of any replaced entry).
    pub fn record_stored(&self, bytes: i64) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_cached.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Mirrors a successful delete of `bytes`.
    pub fn record_removed(&self, bytes: i64) {
        self.bytes_cached.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Sets the bytes-cached gauge outright.
    pub fn set_bytes_cached(&self, bytes: i64) {
        self.bytes_cached.store(bytes, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // == Traffic ==
    pub fn record_upstream_request(&self) {
        self.upstream_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_cached(&self) -> i64 {
        self.bytes_cached.load(Ordering::Relaxed)
    }

    pub fn upstream_requests(&self) -> u64 {
        self.upstream_requests.load(Ordering::Relaxed)
    }

    // == Snapshot ==
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let hits = load(&self.hits);
        let revalidated = load(&self.revalidated);
        let misses = load(&self.misses);

        StatsSnapshot {
            hits,
            misses,
            revalidated,
            stored: load(&self.stored),
            bytes_cached: self.bytes_cached(),
            expirations: load(&self.expirations),
            evictions: load(&self.evictions),
            upstream_requests: load(&self.upstream_requests),
            bytes_served: load(&self.bytes_served),
            coalesced: load(&self.coalesced),
            coalesced_hits: load(&self.coalesced_hits),
            coalesced_misses: load(&self.coalesced_misses),
            coalesced_revalidated: load(&self.coalesced_revalidated),
            non_coalesced: load(&self.non_coalesced),
            hit_rate: hit_rate(hits + revalidated, misses),
        }
    }
}

// == Hit Rate ==
/// Returns served_from_cache / total, or 0.0 if nothing was requested.
fn hit_rate(from_cache: u64, misses: u64) -> f64 {
    let total = from_cache + misses;
    if total == 0 {
        0.0
    } else {
        from_cache as f64 / total as f64
    }
}
