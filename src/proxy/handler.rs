//! Proxy Handler
//!
//! Glue between the listener and the fetch pipeline: parse the request,
//! settle range policy, fetch, evaluate client preconditions and write.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    response::Response,
};
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::cache::{CacheStats, SharedCache};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::fetch::{FetchInfo, FetchResult, Fetcher, Upstream};
use crate::http::{CacheStatus, Precondition, RangeHeader};
use crate::proxy::{ProxyRequest, ResponseWriter};

/// Request-path switches taken from the `proxy` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    pub max_request_body: usize,
    pub retry_on_range_416: bool,
    pub retry_on_invalid_range: bool,
    pub cache_range_requests: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_request_body: 10 * 1024 * 1024,
            retry_on_range_416: false,
            retry_on_invalid_range: false,
            cache_range_requests: true,
        }
    }
}

/// Application state shared across proxy requests.
#[derive(Clone)]
pub struct ProxyState {
    pub fetcher: Arc<Fetcher>,
    pub writer: ResponseWriter,
    pub stats: Arc<CacheStats>,
    pub options: ProxyOptions,
}

impl ProxyState {
    pub fn new(fetcher: Fetcher, stats: Arc<CacheStats>, options: ProxyOptions) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            writer: ResponseWriter::new(stats.clone(), options.retry_on_range_416),
            stats,
            options,
        }
    }

    /// Wires the fetch pipeline over `cache` from configuration.
    pub fn from_config(config: &Config, cache: SharedCache, stats: Arc<CacheStats>) -> Result<Self> {
        let upstream = Upstream::new(config.proxy.upstream_timeout(), stats.clone())?;
        let fetcher = Fetcher::new(cache, upstream, config.cache.policy(), stats.clone());
        Ok(Self::new(fetcher, stats, config.proxy.options()))
    }

    pub fn cache(&self) -> &SharedCache {
        self.fetcher.cache()
    }
}

/// Fallback handler for every proxied request.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    request: Request<Body>,
) -> Result<Response> {
    if request.method() == Method::CONNECT {
        return Err(ProxyError::NotImplemented(
            "CONNECT tunnels are not supported".to_string(),
        ));
    }

    let req = ProxyRequest::from_request(request, state.options.max_request_body).await?;
    handle(&state, req).await.inspect_err(|e| match e {
        ProxyError::Invariant(_) | ProxyError::Internal(_) | ProxyError::Cache(_) => {
            error!(error = %e, "request failed")
        }
        _ => warn!(error = %e, "request failed"),
    })
}

async fn handle(state: &ProxyState, req: ProxyRequest) -> Result<Response> {
    let key = req.key();
    let directives = req.directives();
    let options = state.options;

    // == Range Policy ==
    let (req, range): (ProxyRequest, Option<RangeHeader>) = match directives.range {
        None => (req, None),
        Some(Err(source)) if !options.retry_on_invalid_range => {
            return Err(ProxyError::Range { source, size: None });
        }
        Some(Err(_)) => (req.without_range(), None),
        Some(Ok(range)) if req.method == Method::GET && options.cache_range_requests => {
            (req.without_range(), Some(range))
        }
        Some(Ok(_)) => (req, None),
    };

    debug!(method = %req.method, url = %req.url(), key = %key, "proxy request");
    let mut result = state.fetcher.dedup_fetch(&req, &key).await?;

    if let FetchResult::Direct { response, .. } = &result {
        if response.status == StatusCode::RANGE_NOT_SATISFIABLE
            && options.retry_on_range_416
            && req.headers.contains_key(header::RANGE)
        {
            debug!(key = %key, "origin rejected range, retrying without it");
            result = state.fetcher.dedup_fetch(&req.without_range(), &key).await?;
        }
    }

    state.stats.record_outcome(result.info().status);

    match result {
        FetchResult::Cached {
            entry,
            info,
            coalesced,
        } => {
            let cache_status =
                status_for(&info, coalesced).ttl(entry.metadata.expires, Utc::now());
            let object = &entry.metadata.object;

            match directives
                .conditional
                .evaluate(&object.etag, object.last_modified)
            {
                Precondition::NotModified => {
                    return Ok(state.writer.not_modified(&entry, &cache_status))
                }
                Precondition::Failed => return Ok(state.writer.precondition_failed(&cache_status)),
                Precondition::Proceed => {}
            }

            let range = range.filter(|_| {
                directives
                    .conditional
                    .if_range_matches(&object.etag, object.last_modified)
            });
            state.writer.cached(&req, entry, cache_status, range).await
        }
        FetchResult::Direct { response, info } => {
            Ok(state.writer.direct(&req, response, status_for(&info, false)))
        }
    }
}

fn status_for(info: &FetchInfo, coalesced: bool) -> CacheStatus {
    let mut status = CacheStatus::new(info.status);
    if let Some(forward) = info.forward {
        status = status.forward(forward);
    }
    status
        .forward_status(info.upstream_status)
        .collapsed(coalesced)
        .stored(info.stored)
}
