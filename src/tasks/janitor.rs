//! Janitor Task
//!
//! Background task owned by a cache backend. Each tick runs an expiry sweep
//! followed by size-bounded eviction.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheKey, CacheStats, EntryMetadata, Payload, Removal};

/// Eviction stops once the cache is at or below this share of the bound.
const EVICTION_TARGET: f64 = 0.8;

/// Priority weight per MiB of entry size.
const SIZE_WEIGHT_PER_MIB: f64 = 100.0;

// == Janitor Config ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorConfig {
    /// Time between ticks
    pub interval: Duration,
    /// Aggregate size bound in bytes; zero disables eviction
    pub max_cache_size: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_cache_size: 0,
        }
    }
}

// == Janitor Handle ==
/// Handle to a running janitor.
#[derive(Debug)]
pub struct JanitorHandle {
    /// Cancelled by `stop`
    token: CancellationToken,
    /// The spawned sweep loop
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    /// Signals the janitor to exit after its current tick.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns the janitor for `cache`.
///
/// The task holds only a weak reference, so it exits on its own once the
/// backend is dropped. Ticks that overrun the interval are skipped rather
/// than queued.
///
/// # Arguments
/// * `cache` - Backend to sweep
/// * `config` - Tick interval and aggregate size bound
/// * `stats` - Receives expiration and eviction counts
///
/// # Returns
/// A handle that stops the task
pub fn spawn_janitor<P: Payload>(
    cache: Weak<dyn Cache<P>>,
    config: JanitorConfig,
    stats: Arc<CacheStats>,
) -> JanitorHandle {
    let token = CancellationToken::new();
    let child = token.clone();

    let handle = tokio::spawn(async move {
        info!(
            interval_ms = config.interval.as_millis() as u64,
            max_cache_size = config.max_cache_size,
            "starting cache janitor"
        );

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(cache) = cache.upgrade() else {
                break;
            };

            let expired = sweep_expired(cache.as_ref(), &stats).await;
            let evicted = if config.max_cache_size > 0 {
                enforce_size(cache.as_ref(), config.max_cache_size, &stats).await
            } else {
                0
            };

            if expired > 0 || evicted > 0 {
                info!(expired, evicted, size = cache.size(), "janitor tick");
            } else {
                debug!(size = cache.size(), entries = cache.len(), "janitor tick: nothing to do");
            }
        }

        debug!("cache janitor stopped");
    });

    JanitorHandle { token, handle }
}

// == Expiry Sweep ==
/// Deletes every entry whose `expires` has passed. Contended entries are
/// left for the next tick. Returns the number removed.
pub async fn sweep_expired<P: Payload>(cache: &dyn Cache<P>, stats: &CacheStats) -> usize {
    stats.set_bytes_cached(cache.size());
    let now = Utc::now();
    let is_expired = move |meta: &EntryMetadata<P>| meta.expires < now;

    let candidates: Vec<CacheKey> = cache
        .iterate()
        .filter_map(|(key, meta)| async move { is_expired(&meta).then_some(key) })
        .collect()
        .await;

    let mut removed = 0;
    for key in candidates {
        match cache.try_delete(&key, &is_expired).await {
            Ok(Removal::Removed(_)) => {
                stats.record_expiration();
                removed += 1;
            }
            Ok(Removal::Contended) => debug!(key = %key, "expired entry busy, retrying next tick"),
            Ok(Removal::Skipped) => {}
            Err(e) => warn!(key = %key, error = %e, "failed to remove expired entry"),
        }
    }

    stats.set_bytes_cached(cache.size());
    removed
}

// == Size Eviction ==
/// Eviction priority: milliseconds since last access plus 100 per MiB.
pub fn eviction_priority<P>(meta: &EntryMetadata<P>, now: chrono::DateTime<Utc>) -> f64 {
    let idle_ms = (now - meta.last_access).num_milliseconds().max(0) as f64;
    let size_mib = meta.size.max(0) as f64 / (1024.0 * 1024.0);
    idle_ms + size_mib * SIZE_WEIGHT_PER_MIB
}

/// Evicts highest-priority entries until the cache is at or below 80% of
/// `max_cache_size`. Does nothing while under the bound. Returns the number
/// removed.
pub async fn enforce_size<P: Payload>(
    cache: &dyn Cache<P>,
    max_cache_size: u64,
    stats: &CacheStats,
) -> usize {
    if (cache.size().max(0) as u64) < max_cache_size {
        return 0;
    }

    let now = Utc::now();
    let mut ranked: Vec<(CacheKey, f64)> = cache
        .iterate()
        .map(|(key, meta)| (key, eviction_priority(&meta, now)))
        .collect()
        .await;
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let target = (max_cache_size as f64 * EVICTION_TARGET) as i64;
    let mut removed = 0;
    for (key, _) in ranked {
        if cache.size() <= target {
            break;
        }
        match cache.try_delete(&key, &|_: &EntryMetadata<P>| true).await {
            Ok(Removal::Removed(size)) => {
                stats.record_eviction();
                removed += 1;
                debug!(key = %key, size, "evicted entry");
            }
            Ok(Removal::Contended) => debug!(key = %key, "eviction candidate busy, skipped"),
            Ok(Removal::Skipped) => {}
            Err(e) => warn!(key = %key, error = %e, "failed to evict entry"),
        }
    }

    if cache.size() > target {
        debug!(size = cache.size(), target, "eviction target not reached this tick");
    }
    removed
}
