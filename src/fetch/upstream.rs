//! Upstream client
//!
//! Thin wrapper over `reqwest` for origin round-trips. Redirects are passed
//! through to the client, environment proxies are ignored and bodies are
//! never decoded, so stored bytes match what the origin sent.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use tracing::debug;

use crate::cache::CacheStats;
use crate::error::{ProxyError, Result};
use crate::http::strip_hop_by_hop;
use crate::proxy::ProxyRequest;

#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    stats: Arc<CacheStats>,
}

impl Upstream {
    /// Builds a client whose round-trips give up after `timeout`.
    pub fn new(timeout: Duration, stats: Arc<CacheStats>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("upstream client: {}", e)))?;
        Ok(Self { client, stats })
    }

    /// Sends `req` to its origin and returns once response headers arrive.
    pub async fn send(&self, req: &ProxyRequest) -> Result<reqwest::Response> {
        let url = req.url();
        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut builder = self
            .client
            .request(req.method.clone(), url.as_str())
            .headers(headers);
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        self.stats.record_upstream_request();
        debug!(method = %req.method, url = %url, "upstream request");
        builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(upstream_reason(&e)))
    }
}

/// Short description of a transport failure.
fn upstream_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        format!("connect failed: {}", err)
    } else {
        err.to_string()
    }
}
