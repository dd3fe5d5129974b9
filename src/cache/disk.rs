//! On-Disk Backend
//!
//! Flat directory layout, two files per entry:
//!
//! ```text
//! <hex-key>        raw response body
//! <hex-key>.meta   JSON EntryMetadata sidecar
//! ```
//!
//! Writes go to temporary names and are renamed into place under the key's
//! write lock. There is no index file; the key set is rebuilt by scanning the
//! directory at startup.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cache::{
    Cache, CacheKey, CacheResult, CacheStats, Consumed, Entry, EntryMetadata, EntryReader,
    LockShards, MetadataMutator, Payload, Removal, RemovalPredicate, ShardLock,
};
use crate::error::CacheError;
use crate::tasks::{spawn_janitor, JanitorConfig, JanitorHandle};

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";
const COPY_BUFFER: usize = 64 * 1024;

// == Temp Files ==
/// Removes its files on drop unless disarmed. Covers both errors and a
/// cancelled write.
struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    fn disarm(&mut self) {
        self.paths.clear();
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

// == Disk Cache ==
/// Best-effort durable backend storing bodies as files.
pub struct DiskCache<P> {
    /// Directory holding bodies, sidecars and temporary files
    dir: PathBuf,
    /// Metadata of every committed entry
    index: RwLock<HashMap<CacheKey, Arc<Mutex<EntryMetadata<P>>>>>,
    /// Per-key read/write locks
    locks: LockShards,
    /// Sum of committed body sizes
    size: AtomicI64,
    /// Shared counters
    stats: Arc<CacheStats>,
    /// Background sweeper, if started
    janitor: Mutex<Option<JanitorHandle>>,
    /// Makes temporary names unique within the process
    tmp_counter: AtomicU64,
}

impl<P: Payload> DiskCache<P> {
    // == Constructor ==
    /// Opens (creating if needed) `dir` and recovers the entries already in it.
    ///
    /// # Arguments
    /// * `dir` - Cache directory; created when missing
    /// * `lock_shards` - Number of per-key lock shards
    /// * `stats` - Counters shared with the proxy and the janitor
    ///
    /// # Returns
    /// The recovered store, or the I/O error that prevented reading `dir`
    pub async fn open(
        dir: impl Into<PathBuf>,
        lock_shards: usize,
        stats: Arc<CacheStats>,
    ) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let cache = Self {
            dir,
            index: RwLock::new(HashMap::new()),
            locks: LockShards::new(lock_shards),
            size: AtomicI64::new(0),
            stats,
            janitor: Mutex::new(None),
            tmp_counter: AtomicU64::new(0),
        };
        cache.recover().await?;
        Ok(cache)
    }

    /// Starts the janitor for this store. Replaces any running one.
    pub fn start_janitor(self: &Arc<Self>, config: JanitorConfig) {
        let weak: Weak<dyn Cache<P>> = Arc::downgrade(self) as Weak<dyn Cache<P>>;
        let handle = spawn_janitor(weak, config, self.stats.clone());
        if let Some(previous) = self.janitor.lock().replace(handle) {
            previous.stop();
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.to_hex())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}{}", key.to_hex(), META_SUFFIX))
    }

    fn tmp_path(&self, key: &CacheKey, what: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}.{}.{}{}",
            key.to_hex(),
            std::process::id(),
            n,
            what,
            TMP_SUFFIX
        ))
    }

    fn slot(&self, key: &CacheKey) -> Option<Arc<Mutex<EntryMetadata<P>>>> {
        self.index.read().get(key).cloned()
    }

    // == Recovery ==
    /// Rebuilds the index from the directory. Temporary files, orphaned bodies
    /// and entries whose body length disagrees with the sidecar are removed.
    async fn recover(&self) -> CacheResult<()> {
        let mut names = HashSet::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if let Ok(name) = item.file_name().into_string() {
                names.insert(name);
            }
        }

        let mut recovered = 0usize;
        let mut total = 0i64;
        let mut index = HashMap::new();

        for name in &names {
            let path = self.dir.join(name);
            if name.ends_with(TMP_SUFFIX) {
                remove_if_exists(&path).await;
                continue;
            }
            if let Some(hex) = name.strip_suffix(META_SUFFIX) {
                let Ok(key) = hex.parse::<CacheKey>() else {
                    continue;
                };
                match self.load_entry(&key).await {
                    Some(meta) => {
                        total += meta.size;
                        recovered += 1;
                        index.insert(key, Arc::new(Mutex::new(meta)));
                    }
                    None => {
                        warn!(key = %key, "discarding inconsistent cache entry");
                        remove_if_exists(&self.data_path(&key)).await;
                        remove_if_exists(&path).await;
                    }
                }
            } else if name.parse::<CacheKey>().is_ok()
                && !names.contains(&format!("{}{}", name, META_SUFFIX))
            {
                remove_if_exists(&path).await;
            }
        }

        *self.index.write() = index;
        self.size.store(total, Ordering::Release);
        self.stats.set_bytes_cached(total);
        info!(
            dir = %self.dir.display(),
            entries = recovered,
            bytes = total,
            "disk cache recovered"
        );
        Ok(())
    }

    async fn load_entry(&self, key: &CacheKey) -> Option<EntryMetadata<P>> {
        let raw = fs::read(self.meta_path(key)).await.ok()?;
        let meta: EntryMetadata<P> = serde_json::from_slice(&raw).ok()?;
        let len = fs::metadata(self.data_path(key)).await.ok()?.len();
        (len as i64 == meta.size).then_some(meta)
    }

    /// Removes the entry; caller holds the shard write lock.
    async fn remove_locked(&self, key: &CacheKey) -> Option<i64> {
        let slot = self.index.write().remove(key)?;
        let size = slot.lock().size;
        remove_if_exists(&self.data_path(key)).await;
        remove_if_exists(&self.meta_path(key)).await;
        self.size.fetch_sub(size, Ordering::AcqRel);
        self.stats.record_removed(size);
        Some(size)
    }
}

#[async_trait]
impl<P: Payload> Cache<P> for DiskCache<P> {
    // == Get ==
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry<P>> {
        let _guard = self.lock_of(key).read().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;
        let file = match File::open(self.data_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(CacheError::Miss),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let metadata = {
            let mut meta = slot.lock();
            meta.touch(now);
            meta.clone()
        };
        Ok(Entry {
            data: EntryReader::File(file),
            stale: metadata.is_stale_at(now),
            metadata,
        })
    }

    async fn get_metadata(&self, key: &CacheKey) -> CacheResult<(EntryMetadata<P>, bool)> {
        let _guard = self.lock_of(key).read().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;
        let meta = slot.lock().clone();
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
        let data_tmp = self.tmp_path(key, "data");
        let mut temps = TempFiles {
            paths: vec![data_tmp.clone()],
        };

        // streaming ingest happens outside the shard lock
        let mut file = File::create(&data_tmp).await?;
        // follows the inode through the rename, or replays a failed ingest
        let reader = File::open(&data_tmp).await?;
        let mut written = 0u64;
        let mut pending = Bytes::new();

        let stored = async {
            let mut chunk = vec![0u8; COPY_BUFFER];
            loop {
                let n = body.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                // only flushed bytes count as written
                if let Err(e) = write_through(&mut file, &chunk[..n]).await {
                    pending = Bytes::copy_from_slice(&chunk[..n]);
                    return Err(e.into());
                }
                written += n as u64;
            }
            file.sync_all().await?;
            drop(file);

            let now = Utc::now();
            let meta = EntryMetadata::new(now, expires, written as i64, object);
            let meta_tmp = self.tmp_path(key, "meta");
            temps.paths.push(meta_tmp.clone());
            fs::write(&meta_tmp, serde_json::to_vec(&meta)?).await?;

            let data_path = self.data_path(key);
            let _guard = self.lock_of(key).write().await;
            fs::rename(&data_tmp, &data_path).await?;
            if let Err(e) = fs::rename(&meta_tmp, self.meta_path(key)).await {
                // the previous body is already overwritten; drop the entry entirely
                if self.remove_locked(key).await.is_none() {
                    remove_if_exists(&data_path).await;
                }
                return Err(e.into());
            }
            temps.disarm();

            let previous = self
                .index
                .write()
                .insert(*key, Arc::new(Mutex::new(meta.clone())));
            let previous_size = previous.map(|p| p.lock().size).unwrap_or(0);
            self.size.fetch_add(meta.size - previous_size, Ordering::AcqRel);
            self.stats.record_stored(meta.size - previous_size);
            Ok::<_, CacheError>(meta)
        }
        .await;

        match stored {
            Ok(meta) => {
                debug!(key = %key, size = meta.size, "stored entry on disk");
                Ok(Entry {
                    data: EntryReader::File(reader),
                    stale: meta.is_stale(),
                    metadata: meta,
                })
            }
            Err(e) => Err(e.after_reading(Consumed::spilled(reader, written, pending))),
        }
    }

    async fn update_metadata(
        &self,
        key: &CacheKey,
        mutator: MetadataMutator<'_, P>,
    ) -> CacheResult<()> {
        let _guard = self.lock_of(key).write().await;
        let slot = self.slot(key).ok_or(CacheError::Miss)?;

        let mut updated = slot.lock().clone();
        let size = updated.size;
        mutator(&mut updated);
        updated.size = size;

        let tmp = self.tmp_path(key, "meta");
        let mut temps = TempFiles {
            paths: vec![tmp.clone()],
        };
        fs::write(&tmp, serde_json::to_vec(&updated)?).await?;
        fs::rename(&tmp, self.meta_path(key)).await?;
        temps.disarm();

        *slot.lock() = updated;
        Ok(())
    }

    // == Delete ==
    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let _guard = self.lock_of(key).write().await;
        self.remove_locked(key)
            .await
            .map(|_| ())
            .ok_or(CacheError::Miss)
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
        let matches = predicate(&slot.lock());
        if !matches {
            return Ok(Removal::Skipped);
        }
        Ok(self
            .remove_locked(key)
            .await
            .map(Removal::Removed)
            .unwrap_or(Removal::Skipped))
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.index.read().keys().copied().collect()
    }

    fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.index.read().len()
    }

    fn lock_of(&self, key: &CacheKey) -> &ShardLock {
        self.locks.lock_of(key)
    }

    fn destroy(&self) {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.stop();
        }
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

async fn write_through(file: &mut File, chunk: &[u8]) -> std::io::Result<()> {
    file.write_all(chunk).await?;
    file.flush().await
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectInfo;
    use chrono::Duration;
    use tempfile::TempDir;

    fn key(path: &str) -> CacheKey {
        CacheKey::from_parts("http", "example.com", "GET", path, "")
    }

    async fn open(dir: &TempDir) -> DiskCache<ObjectInfo> {
        DiskCache::open(dir.path(), 32, Arc::new(CacheStats::new()))
            .await
            .unwrap()
    }

    fn in_a_minute() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(60)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;

        let info = ObjectInfo {
            etag: "\"x\"".to_string(),
            ..ObjectInfo::default()
        };
        cache
            .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), info)
            .await
            .unwrap();

        let mut entry = cache.get(&key("/a")).await.unwrap();
        assert_eq!(entry.data.read_all().await.unwrap(), b"hello");
        assert_eq!(entry.metadata.object.etag, "\"x\"");
        assert_eq!(cache.size(), 5);

        let hex = key("/a").to_hex();
        assert!(dir.path().join(&hex).exists());
        assert!(dir.path().join(format!("{}.meta", hex)).exists());
    }

    #[tokio::test]
    async fn test_sidecar_is_json() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache
            .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join(format!("{}.meta", key("/a").to_hex()))).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["file_size"], 5);
        assert!(json["time_written"].is_string());
        assert!(json["last_access"].is_string());
        assert!(json["expires"].is_string());
        assert!(json["object"]["header"].is_object());
    }

    #[tokio::test]
    async fn test_recover_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir).await;
            cache
                .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
                .await
                .unwrap();
            cache
                .cache(&key("/b"), &mut &b"world!"[..], in_a_minute(), ObjectInfo::default())
                .await
                .unwrap();
        }

        let cache = open(&dir).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 11);
        let mut entry = cache.get(&key("/b")).await.unwrap();
        assert_eq!(entry.data.read_all().await.unwrap(), b"world!");
    }

    #[tokio::test]
    async fn test_recover_discards_debris() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir).await;
            cache
                .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
                .await
                .unwrap();
            cache
                .cache(&key("/b"), &mut &b"world"[..], in_a_minute(), ObjectInfo::default())
                .await
                .unwrap();
        }
        // truncated body, orphan body, stray temp file
        std::fs::write(dir.path().join(key("/b").to_hex()), b"wor").unwrap();
        std::fs::write(dir.path().join(key("/c").to_hex()), b"orphan").unwrap();
        std::fs::write(dir.path().join(".junk.data.tmp"), b"partial").unwrap();

        let cache = open(&dir).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("/a")).await.is_ok());
        assert!(matches!(cache.get(&key("/b")).await, Err(CacheError::Miss)));
        assert!(!dir.path().join(key("/c").to_hex()).exists());
        assert!(!dir.path().join(".junk.data.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache
            .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
            .await
            .unwrap();
        cache.delete(&key("/a")).await.unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert!(!dir.path().join(key("/a").to_hex()).exists());
        assert!(matches!(cache.get(&key("/a")).await, Err(CacheError::Miss)));
    }

    #[tokio::test]
    async fn test_open_handle_survives_delete() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache
            .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
            .await
            .unwrap();
        let mut entry = cache.get(&key("/a")).await.unwrap();
        cache.delete(&key("/a")).await.unwrap();
        assert_eq!(entry.data.read_all().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_nothing() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("upstream reset")))
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        let result = cache
            .cache(&key("/a"), &mut Failing, in_a_minute(), ObjectInfo::default())
            .await;
        assert!(matches!(result, Err(CacheError::Io(_))));
        assert!(cache.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_ingest_returns_consumed_bytes() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        let mut body = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .read_error(std::io::Error::other("upstream reset"))
            .build();

        let err = cache
            .cache(&key("/a"), &mut body, in_a_minute(), ObjectInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err.cause(), CacheError::Io(_)));
        assert!(cache.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let (_, consumed) = err.into_parts();
        let consumed = consumed.unwrap();
        assert_eq!(consumed.len(), 11);
        let mut replay = Vec::new();
        consumed.into_reader().read_to_end(&mut replay).await.unwrap();
        assert_eq!(replay, b"hello world");
    }

    #[tokio::test]
    async fn test_update_metadata_persists() {
        let dir = TempDir::new().unwrap();
        let later = Utc::now() + Duration::hours(3);
        {
            let cache = open(&dir).await;
            cache
                .cache(&key("/a"), &mut &b"hello"[..], in_a_minute(), ObjectInfo::default())
                .await
                .unwrap();
            cache
                .update_metadata(
                    &key("/a"),
                    Box::new(move |meta: &mut EntryMetadata<ObjectInfo>| meta.expires = later),
                )
                .await
                .unwrap();
        }

        let cache = open(&dir).await;
        let (meta, stale) = cache.get_metadata(&key("/a")).await.unwrap();
        assert_eq!(meta.expires, later);
        assert!(!stale);
    }
}
