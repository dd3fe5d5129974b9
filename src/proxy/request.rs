//! Proxy Request Model
//!
//! A buffered, owned view of an inbound proxy request that can be cloned into
//! the variants sent upstream (revalidation, range-stripped).

use axum::body::{self, Body};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request};
use bytes::Bytes;

use crate::cache::{CacheKey, ObjectInfo};
use crate::error::{ProxyError, Result};
use crate::http::directives::format_http_date;
use crate::http::{strip_conditionals, HeaderDirectives};

/// Request extension marking traffic that arrived through a terminated TLS
/// tunnel. Such requests are keyed and forwarded as `https`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunneled;

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub scheme: String,
    /// `host[:port]` of the origin
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    // == Constructor ==
    /// Reads the target from an absolute-form URI or, failing that, the `Host`
    /// header, and buffers at most `max_body` bytes of body.
    pub async fn from_request(request: Request<Body>, max_body: usize) -> Result<Self> {
        let (parts, body) = request.into_parts();

        let host = parts
            .uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_string())
            })
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ProxyError::BadRequest("request names no origin host".to_string()))?;

        let scheme = match parts.uri.scheme_str() {
            Some("https") => "https",
            Some("http") => "http",
            Some(other) => {
                return Err(ProxyError::BadRequest(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
            None if parts.extensions.get::<Tunneled>().is_some() => "https",
            None => "http",
        };

        let path = match parts.uri.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };

        let body = body::to_bytes(body, max_body)
            .await
            .map_err(|e| ProxyError::BadRequest(format!("request body: {}", e)))?;

        Ok(Self {
            method: parts.method,
            scheme: scheme.to_string(),
            host,
            path,
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        })
    }

    /// Origin URL for the upstream round-trip.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}://{}{}?{}", self.scheme, self.host, self.path, query),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }

    /// Cache key of the request's identity.
    pub fn key(&self) -> CacheKey {
        CacheKey::from_parts(
            &self.scheme,
            &self.host,
            self.method.as_str(),
            &self.path,
            self.query.as_deref().unwrap_or(""),
        )
    }

    pub fn directives(&self) -> HeaderDirectives {
        HeaderDirectives::parse(&self.headers)
    }

    /// Only a plain `GET` may share a fetch or be stored.
    pub fn is_coalescible(&self) -> bool {
        self.method == Method::GET && !self.headers.contains_key(header::RANGE)
    }

    /// Copy without `Range` and `If-Range`.
    pub fn without_range(&self) -> Self {
        let mut req = self.clone();
        req.headers.remove(header::RANGE);
        req.headers.remove(header::IF_RANGE);
        req
    }

    /// Copy to send upstream when filling or revalidating the cache.
    ///
    /// Client conditionals are dropped; with `validators` the stored entry's
    /// `ETag` and `Last-Modified` become `If-None-Match` and
    /// `If-Modified-Since`.
    pub fn upstream_form(&self, validators: Option<&ObjectInfo>) -> Self {
        let mut req = self.clone();
        strip_conditionals(&mut req.headers);

        if let Some(object) = validators {
            if !object.etag.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&object.etag) {
                    req.headers.insert(header::IF_NONE_MATCH, value);
                }
            }
            if let Some(modified) = object.last_modified {
                if let Ok(value) = HeaderValue::from_str(&format_http_date(modified)) {
                    req.headers.insert(header::IF_MODIFIED_SINCE, value);
                }
            }
        }
        req
    }
}
