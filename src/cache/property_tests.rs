//! Property-Based Tests for Cache Module
//!
//! Exercises both backends through the `Cache` trait, plus the key and range laws
//! the backends rely on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use crate::cache::{
    clean_path, Cache, CacheKey, CacheStats, DiskCache, MemoryCache, ObjectInfo,
};
use crate::http::{CacheControl, RangeHeader};

// == Test Configuration ==
const TEST_MEMORY_LIMIT: u64 = 1 << 22;
const TEST_SHARDS: usize = 16;

/// Runs `check` against a fresh memory backend and a fresh disk backend.
fn with_backends<F, Fut>(check: F)
where
    F: Fn(Arc<dyn Cache<ObjectInfo>>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    tokio_test::block_on(async {
        let memory = Arc::new(MemoryCache::<ObjectInfo>::new(
            TEST_MEMORY_LIMIT,
            TEST_SHARDS,
            Arc::new(CacheStats::new()),
        ));
        check(memory as Arc<dyn Cache<ObjectInfo>>).await;

        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::<ObjectInfo>::open(dir.path(), TEST_SHARDS, Arc::new(CacheStats::new()))
            .await
            .unwrap();
        check(Arc::new(disk) as Arc<dyn Cache<ObjectInfo>>).await;
    });
}

fn key_for(path: &str) -> CacheKey {
    CacheKey::from_parts("http", "origin.test", "GET", path, "")
}

// == Strategies ==
fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

fn path_strategy() -> impl Strategy<Value = String> {
    "(/[a-z0-9._-]{0,8}){1,4}"
}

/// Operations against a small key space so puts and deletes collide.
#[derive(Debug, Clone)]
enum CacheOp {
    Put { slot: u8, len: usize },
    Delete { slot: u8 },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0u8..6, 1usize..2048).prop_map(|(slot, len)| CacheOp::Put { slot, len }),
        (0u8..6).prop_map(|slot| CacheOp::Delete { slot }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// What `cache` stores, `get` returns byte for byte, in both backends.
    #[test]
    fn prop_roundtrip(body in body_strategy(), path in path_strategy()) {
        let key = key_for(&path);
        let expected = body.clone();
        with_backends(|cache| {
            let body = expected.clone();
            async move {
                let expires = Utc::now() + Duration::seconds(60);
                let stored = cache
                    .cache(&key, &mut body.as_slice(), expires, ObjectInfo::default())
                    .await
                    .unwrap();
                assert_eq!(stored.size(), body.len() as u64);

                let mut entry = cache.get(&key).await.unwrap();
                assert!(!entry.stale);
                assert_eq!(entry.data.read_all().await.unwrap(), body);
                assert_eq!(cache.size(), body.len() as i64);
            }
        });
    }

    /// A deleted key is a miss and contributes nothing to the size.
    #[test]
    fn prop_delete_then_miss(body in body_strategy(), path in path_strategy()) {
        let key = key_for(&path);
        with_backends(|cache| {
            let body = body.clone();
            async move {
                let expires = Utc::now() + Duration::seconds(60);
                cache
                    .cache(&key, &mut body.as_slice(), expires, ObjectInfo::default())
                    .await
                    .unwrap();
                cache.delete(&key).await.unwrap();

                assert!(cache.get(&key).await.unwrap_err().is_miss());
                assert!(cache.delete(&key).await.unwrap_err().is_miss());
                assert_eq!(cache.size(), 0);
                assert!(cache.is_empty());
            }
        });
    }

    /// Overwriting a key leaves only the latest body and its size.
    #[test]
    fn prop_overwrite(first in body_strategy(), second in body_strategy()) {
        let key = key_for("/overwrite");
        with_backends(|cache| {
            let (first, second) = (first.clone(), second.clone());
            async move {
                let expires = Utc::now() + Duration::seconds(60);
                cache
                    .cache(&key, &mut first.as_slice(), expires, ObjectInfo::default())
                    .await
                    .unwrap();
                cache
                    .cache(&key, &mut second.as_slice(), expires, ObjectInfo::default())
                    .await
                    .unwrap();

                let mut entry = cache.get(&key).await.unwrap();
                assert_eq!(entry.data.read_all().await.unwrap(), second);
                assert_eq!(cache.len(), 1);
                assert_eq!(cache.size(), second.len() as i64);
            }
        });
    }

    /// After any sequence of puts and deletes, the backend size is the sum of
    /// the live entries' sizes.
    #[test]
    fn prop_size_accounting(ops in prop::collection::vec(cache_op_strategy(), 1..24)) {
        with_backends(|cache| {
            let ops = ops.clone();
            async move {
                let expires = Utc::now() + Duration::seconds(60);
                let mut model: HashMap<u8, usize> = HashMap::new();

                for op in ops {
                    match op {
                        CacheOp::Put { slot, len } => {
                            let body = vec![slot; len];
                            cache
                                .cache(
                                    &key_for(&format!("/{}", slot)),
                                    &mut body.as_slice(),
                                    expires,
                                    ObjectInfo::default(),
                                )
                                .await
                                .unwrap();
                            model.insert(slot, len);
                        }
                        CacheOp::Delete { slot } => {
                            let removed = cache.delete(&key_for(&format!("/{}", slot))).await;
                            assert_eq!(removed.is_ok(), model.remove(&slot).is_some());
                        }
                    }
                }

                assert_eq!(cache.len(), model.len());
                assert_eq!(cache.size(), model.values().sum::<usize>() as i64);
            }
        });
    }

    /// Keys ignore host case and path spelling, and survive a hex round-trip.
    #[test]
    fn prop_key_laws(host in "[a-zA-Z0-9.]{1,16}", path in path_strategy(), query in "[a-z=&]{0,8}") {
        let key = CacheKey::from_parts("http", &host, "GET", &path, &query);
        prop_assert_eq!(key, CacheKey::from_parts("http", &host.to_ascii_uppercase(), "GET", &path, &query));
        prop_assert_eq!(key, CacheKey::from_parts("http", &host, "GET", &format!("{}/.", path), &query));
        prop_assert_ne!(key, CacheKey::from_parts("https", &host, "GET", &path, &query));
        prop_assert_ne!(key, CacheKey::from_parts("http", &host, "HEAD", &path, &query));
        prop_assert_eq!(key.to_hex().parse::<CacheKey>().unwrap(), key);
    }

    /// Cleaning a path is idempotent and never escapes the root.
    #[test]
    fn prop_clean_path_idempotent(path in "(/(\\.\\.|\\.|[a-z]{1,3})){0,8}/?") {
        let cleaned = clean_path(&path);
        prop_assert_eq!(clean_path(&cleaned), cleaned.clone());
        prop_assert!(!cleaned.contains(".."));
        if path.starts_with('/') {
            prop_assert!(cleaned.starts_with('/'));
        }
    }

    /// A resolved slice always lies inside the body, and resolving is stable
    /// under re-rendering the header.
    #[test]
    fn prop_range_slice_in_bounds(start in 0u64..200, end in 0u64..200, suffix in 0u64..200, len in 0u64..150) {
        for range in [
            RangeHeader::Bounded { start, end },
            RangeHeader::From { start },
            RangeHeader::Suffix { length: suffix },
        ] {
            let reparsed = RangeHeader::parse(&range.to_string()).unwrap();
            prop_assert_eq!(reparsed.slice_size(len), range.slice_size(len));

            if let Ok((first, last)) = range.slice_size(len) {
                prop_assert!(first <= last);
                prop_assert!(last < len);
            }
        }
    }

    /// Rendering and re-parsing `Cache-Control` preserves the directives.
    #[test]
    fn prop_cache_control_reparse(no_cache in any::<bool>(), max_age in proptest::option::of(1u64..1_000_000)) {
        let cc = CacheControl {
            no_cache,
            max_age: max_age.map(std::time::Duration::from_secs),
        };
        prop_assert_eq!(CacheControl::parse(&cc.to_string()), cc);
    }
}
