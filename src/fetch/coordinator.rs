//! Fetch Coordinator
//!
//! Turns a request into either a cached entry or a direct upstream response,
//! collapsing concurrent misses and revalidations for the same key into one
//! upstream round-trip.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, warn};

use crate::cache::{CacheKey, CacheStats, Entry, EntryMetadata, ObjectInfo, SharedCache};
use crate::error::{CacheError, ProxyError, Result};
use crate::fetch::singleflight::{Group, Joined};
use crate::fetch::upstream::Upstream;
use crate::http::directives::add_duration;
use crate::http::{CachePolicy, Forward, HeaderDirectives, HitStatus};
use crate::proxy::ProxyRequest;

// == Fetch Result ==
/// Cache accounting for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchInfo {
    pub status: HitStatus,
    /// Why the request went to the origin, if it did
    pub forward: Option<Forward>,
    /// Origin status code when a request went out
    pub upstream_status: Option<u16>,
    /// The entry was written or refreshed by this fetch
    pub stored: bool,
}

impl FetchInfo {
    fn hit() -> Self {
        Self {
            status: HitStatus::Hit,
            forward: None,
            upstream_status: None,
            stored: false,
        }
    }

    fn direct(forward: Forward, upstream_status: StatusCode) -> Self {
        Self {
            status: HitStatus::Miss,
            forward: Some(forward),
            upstream_status: Some(upstream_status.as_u16()),
            stored: false,
        }
    }
}

/// Body bytes streamed to the client without going through the store.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An origin response passed through to the client.
pub struct DirectResponse {
    pub status: StatusCode,
    /// Origin headers, hop-by-hop included
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl From<reqwest::Response> for DirectResponse {
    fn from(response: reqwest::Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes_stream().map_err(std::io::Error::other).boxed(),
        }
    }
}

/// Outcome of [`Fetcher::dedup_fetch`].
pub enum FetchResult {
    /// Served from the store through a fresh reader
    Cached {
        entry: Entry<ObjectInfo>,
        info: FetchInfo,
        /// Received from another request's fetch
        coalesced: bool,
    },
    /// Streamed straight from the origin, not stored
    Direct {
        response: DirectResponse,
        info: FetchInfo,
    },
}

impl FetchResult {
    pub fn info(&self) -> &FetchInfo {
        match self {
            FetchResult::Cached { info, .. } | FetchResult::Direct { info, .. } => info,
        }
    }

    fn direct(response: impl Into<DirectResponse>, forward: Forward) -> Self {
        let response = response.into();
        let info = FetchInfo::direct(forward, response.status);
        FetchResult::Direct { response, info }
    }
}

/// What followers learn about the leader's fetch.
#[derive(Debug, Clone)]
enum Summary {
    Cached(FetchInfo),
    Direct,
    Failed(Arc<ProxyError>),
}

impl Summary {
    fn of(result: &Result<FetchResult>) -> Self {
        match result {
            Ok(FetchResult::Cached { info, .. }) => Summary::Cached(*info),
            Ok(FetchResult::Direct { .. }) => Summary::Direct,
            Err(e) => Summary::Failed(Arc::new(e.duplicate())),
        }
    }
}

// == Fetcher ==
/// Decides between the store and the origin for every proxied request.
pub struct Fetcher {
    /// Backend entries are read from and written to
    cache: SharedCache,
    /// Client for origin round-trips
    upstream: Upstream,
    /// Freshness defaults applied to origin responses
    policy: CachePolicy,
    /// Coalescing and upstream counters
    stats: Arc<CacheStats>,
    /// In-flight fetches by key
    group: Group<Summary>,
}

impl Fetcher {
    /// Creates a fetcher with no fetches in flight.
    ///
    /// # Arguments
    /// * `cache` - Backend shared with the janitor and the stats endpoint
    /// * `upstream` - Origin client
    /// * `policy` - Default and maximum ages for stored responses
    /// * `stats` - Counters shared with the rest of the proxy
    ///
    /// # Returns
    /// A new `Fetcher` instance
    pub fn new(
        cache: SharedCache,
        upstream: Upstream,
        policy: CachePolicy,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            cache,
            upstream,
            policy,
            stats,
            group: Group::new(),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Fetches `req`, from the store when possible.
    ///
    /// Requests that cannot share a result (anything but a plain `GET`) go
    /// straight to the origin. Otherwise one caller per key performs the
    /// lookup and any upstream round-trip; callers arriving meanwhile reuse a
    /// cached outcome or issue their own request if the outcome was direct.
    pub async fn dedup_fetch(&self, req: &ProxyRequest, key: &CacheKey) -> Result<FetchResult> {
        if !req.is_coalescible() {
            self.stats.record_non_coalesced();
            let response = self.upstream.send(&req.upstream_form(None)).await?;
            return Ok(FetchResult::direct(response, Forward::Bypass));
        }

        let joined = self
            .group
            .work(&key.to_hex(), async {
                let result = self.internal_fetch(req, key).await;
                let summary = Summary::of(&result);
                (result, summary)
            })
            .await
            .map_err(|_| ProxyError::Cancelled)?;

        match joined {
            Joined::Leader(result) => {
                self.stats.record_non_coalesced();
                result
            }
            Joined::Follower(summary) => self.follow(req, key, summary).await,
        }
    }

    /// Follower side of a collapsed fetch.
    async fn follow(
        &self,
        req: &ProxyRequest,
        key: &CacheKey,
        summary: Summary,
    ) -> Result<FetchResult> {
        match summary {
            Summary::Failed(err) => Err(err.duplicate()),
            Summary::Direct => {
                debug!(key = %key, "leader response was not cacheable, fetching again");
                self.stats.record_non_coalesced();
                self.refetch(req).await
            }
            Summary::Cached(info) => match self.cache.get(key).await {
                Ok(entry) => {
                    self.stats.record_coalesced(info.status);
                    Ok(FetchResult::Cached {
                        entry,
                        info,
                        coalesced: true,
                    })
                }
                Err(CacheError::Miss) => {
                    debug!(key = %key, "collapsed entry vanished, fetching again");
                    self.stats.record_non_coalesced();
                    self.refetch(req).await
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Store lookup for the leader, falling through to the origin on a miss
    /// or a stale entry.
    async fn internal_fetch(&self, req: &ProxyRequest, key: &CacheKey) -> Result<FetchResult> {
        let prior = match self.cache.get_metadata(key).await {
            Ok((_, false)) => match self.cache.get(key).await {
                Ok(entry) => {
                    return Ok(FetchResult::Cached {
                        entry,
                        info: FetchInfo::hit(),
                        coalesced: false,
                    })
                }
                Err(CacheError::Miss) => None,
                Err(e) => return Err(e.into()),
            },
            Ok((meta, true)) => Some(meta),
            Err(CacheError::Miss) => None,
            Err(e) => return Err(e.into()),
        };

        self.fetch_and_store(req, key, prior).await
    }

    /// Upstream round-trip for a miss (`prior == None`) or a revalidation.
    async fn fetch_and_store(
        &self,
        req: &ProxyRequest,
        key: &CacheKey,
        prior: Option<EntryMetadata<ObjectInfo>>,
    ) -> Result<FetchResult> {
        let outgoing = req.upstream_form(prior.as_ref().map(|meta| &meta.object));
        let response = self.upstream.send(&outgoing).await?;
        let status = response.status();
        let now = Utc::now();
        let hit = if prior.is_some() {
            HitStatus::Revalidated
        } else {
            HitStatus::Miss
        };

        if status == StatusCode::NOT_MODIFIED {
            if prior.is_none() {
                error!(key = %key, "origin answered 304 to an unconditional request");
                return Err(ProxyError::Invariant(
                    "304 Not Modified without a stored entry".to_string(),
                ));
            }
            return self.refresh(req, key).await;
        }

        let directives = HeaderDirectives::parse(response.headers());
        let cacheable = status == StatusCode::OK
            && req.method == Method::GET
            && directives.should_cache(now, &self.policy);

        if !cacheable {
            if prior.is_some() && status == StatusCode::OK {
                // the origin no longer lets this response be stored
                match self.cache.delete(key).await {
                    Ok(()) | Err(CacheError::Miss) => {}
                    Err(e) => warn!(key = %key, error = %e, "failed to drop stale entry"),
                }
            }
            debug!(key = %key, status = status.as_u16(), "bypassing cache");
            return Ok(FetchResult::direct(response, Forward::Bypass));
        }

        let expires = directives.expires_or_default(now, &self.policy);
        let object = ObjectInfo::from_headers(response.headers());
        let DirectResponse { headers, body, .. } = DirectResponse::from(response);
        let mut body = StreamReader::new(body);

        match self.cache.cache(key, &mut body, expires, object).await {
            Ok(entry) => {
                debug!(key = %key, size = entry.size(), "stored upstream response");
                Ok(FetchResult::Cached {
                    entry,
                    info: FetchInfo {
                        status: hit,
                        forward: Some(Forward::Miss),
                        upstream_status: Some(status.as_u16()),
                        stored: true,
                    },
                    coalesced: false,
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "caching failed, serving directly");
                // replay what the failed write took, then the rest of the same body
                let (_, consumed) = e.into_parts();
                let rest = ReaderStream::new(body);
                let body = match consumed {
                    Some(consumed) => ReaderStream::new(consumed.into_reader())
                        .chain(rest)
                        .boxed(),
                    None => rest.boxed(),
                };
                let response = DirectResponse {
                    status,
                    headers,
                    body,
                };
                Ok(FetchResult::direct(response, Forward::Miss))
            }
        }
    }

    /// Extends a revalidated entry and reopens it.
    async fn refresh(&self, req: &ProxyRequest, key: &CacheKey) -> Result<FetchResult> {
        let expires = add_duration(Utc::now(), self.policy.default_max_age);
        let updated = self
            .cache
            .update_metadata(
                key,
                Box::new(move |meta: &mut EntryMetadata<ObjectInfo>| meta.expires = expires),
            )
            .await;

        let entry = match updated {
            Ok(()) => self.cache.get(key).await,
            Err(e) => Err(e),
        };
        match entry {
            Ok(entry) => Ok(FetchResult::Cached {
                entry,
                info: FetchInfo {
                    status: HitStatus::Revalidated,
                    forward: Some(Forward::Stale),
                    upstream_status: Some(StatusCode::NOT_MODIFIED.as_u16()),
                    stored: true,
                },
                coalesced: false,
            }),
            Err(CacheError::Miss) => {
                debug!(key = %key, "revalidated entry was evicted, fetching again");
                self.refetch(req).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Plain upstream fetch served directly.
    async fn refetch(&self, req: &ProxyRequest) -> Result<FetchResult> {
        let response = self.upstream.send(&req.upstream_form(None)).await?;
        Ok(FetchResult::direct(response, Forward::Miss))
    }
}
