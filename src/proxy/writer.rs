//! Response Writer
//!
//! Builds client responses from cached entries and direct upstream responses:
//! status line, header hygiene, range slicing, `Cache-Status`/`Via`/`Age`
//! and served-bytes accounting.

use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use chrono::Utc;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::cache::{CacheStats, Entry, ObjectInfo};
use crate::error::{ProxyError, Result};
use crate::fetch::DirectResponse;
use crate::http::{
    current_age, strip_hop_by_hop, CacheStatus, HitStatus, RangeHeader, CACHE_STATUS,
};
use crate::proxy::ProxyRequest;

/// `Via` value added to every response.
pub const VIA: &str = "HTTP/1.1 reservoir";

type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Clone)]
pub struct ResponseWriter {
    stats: Arc<CacheStats>,
    /// Serve the full body instead of 416 for an unsatisfiable range
    retry_on_range_416: bool,
}

impl ResponseWriter {
    pub fn new(stats: Arc<CacheStats>, retry_on_range_416: bool) -> Self {
        Self {
            stats,
            retry_on_range_416,
        }
    }

    // == Cached ==
    /// Writes a stored entry, sliced to `range` when given.
    pub async fn cached(
        &self,
        req: &ProxyRequest,
        entry: Entry<ObjectInfo>,
        cache_status: CacheStatus,
        range: Option<RangeHeader>,
    ) -> Result<Response> {
        let size = entry.size();
        let mut headers = self.entry_headers(&entry, &cache_status);

        let slice = match range.map(|range| range.slice_size(size)) {
            None => None,
            Some(Ok(bounds)) => Some(bounds),
            Some(Err(_)) if self.retry_on_range_416 => None,
            Some(Err(source)) => {
                return Err(ProxyError::Range {
                    source,
                    size: Some(size),
                })
            }
        };

        let (status, reader, length) = match slice {
            Some((start, end)) => {
                let content_range = format!("bytes {}-{}/{}", start, end, size);
                if let Ok(value) = HeaderValue::from_str(&content_range) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                let reader = entry
                    .data
                    .into_slice(start, end)
                    .await
                    .map_err(|e| ProxyError::Internal(format!("cached body: {}", e)))?;
                (StatusCode::PARTIAL_CONTENT, Box::pin(reader) as BodyReader, end - start + 1)
            }
            None => (StatusCode::OK, Box::pin(entry.data) as BodyReader, size),
        };

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        let body = if req.method == Method::HEAD {
            Body::empty()
        } else {
            self.reader_body(reader)
        };
        Ok(build(status, headers, body))
    }

    /// `304 Not Modified` for a client whose validators match the entry.
    pub fn not_modified(&self, entry: &Entry<ObjectInfo>, cache_status: &CacheStatus) -> Response {
        let mut headers = self.entry_headers(entry, cache_status);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_ENCODING);
        build(StatusCode::NOT_MODIFIED, headers, Body::empty())
    }

    /// `412 Precondition Failed` for a client whose `If-Match` or
    /// `If-Unmodified-Since` does not hold.
    pub fn precondition_failed(&self, cache_status: &CacheStatus) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        insert_proxy_headers(&mut headers, cache_status);
        build(
            StatusCode::PRECONDITION_FAILED,
            headers,
            Body::from("412 precondition failed\n"),
        )
    }

    // == Direct ==
    /// Streams an upstream response through unchanged apart from hop-by-hop
    /// headers.
    pub fn direct(
        &self,
        req: &ProxyRequest,
        response: DirectResponse,
        cache_status: CacheStatus,
    ) -> Response {
        let DirectResponse {
            status,
            mut headers,
            body,
        } = response;
        strip_hop_by_hop(&mut headers);
        insert_proxy_headers(&mut headers, &cache_status);

        let body = if req.method == Method::HEAD {
            Body::empty()
        } else {
            let stats = self.stats.clone();
            Body::from_stream(
                body.inspect_ok(move |chunk| stats.record_bytes_served(chunk.len() as u64))
                    .inspect_err(|e| warn!(error = %e, "upstream body interrupted")),
            )
        };
        build(status, headers, body)
    }

    fn entry_headers(&self, entry: &Entry<ObjectInfo>, cache_status: &CacheStatus) -> HeaderMap {
        let mut headers = entry.metadata.object.header_map();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_RANGE);

        if cache_status.hit_status() != HitStatus::Miss {
            let age = current_age(&headers, entry.metadata.time_written, Utc::now());
            headers.insert(header::AGE, HeaderValue::from(age));
        }
        insert_proxy_headers(&mut headers, cache_status);
        headers
    }

    fn reader_body(&self, reader: BodyReader) -> Body {
        let stats = self.stats.clone();
        Body::from_stream(
            ReaderStream::new(reader)
                .inspect_ok(move |chunk| stats.record_bytes_served(chunk.len() as u64))
                .inspect_err(|e| warn!(error = %e, "cached body read failed")),
        )
    }
}

fn insert_proxy_headers(headers: &mut HeaderMap, cache_status: &CacheStatus) {
    if let Ok(value) = HeaderValue::from_str(&cache_status.to_string()) {
        headers.insert(CACHE_STATUS, value);
    }
    headers.insert(header::VIA, HeaderValue::from_static(VIA));
}

fn build(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntryMetadata, EntryReader};
    use crate::error::RangeError;
    use crate::http::HeaderDirectives;
    use axum::body::to_bytes;
    use bytes::Bytes;
    use chrono::Duration;
    use futures::StreamExt;
    use std::io::Cursor;

    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    fn entry() -> Entry<ObjectInfo> {
        let now = Utc::now();
        let mut origin = HeaderMap::new();
        origin.insert(header::ETAG, HeaderValue::from_static("\"x\""));
        origin.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        origin.insert(header::CONTENT_LENGTH, HeaderValue::from_static("36"));
        Entry {
            data: EntryReader::Memory(Cursor::new(Bytes::from_static(BODY))),
            metadata: EntryMetadata::new(
                now,
                now + Duration::seconds(60),
                BODY.len() as i64,
                ObjectInfo::from_headers(&origin),
            ),
            stale: false,
        }
    }

    async fn request(method: Method) -> ProxyRequest {
        ProxyRequest::from_request(
            axum::http::Request::builder()
                .method(method)
                .uri("http://origin.test/range")
                .body(Body::empty())
                .unwrap(),
            1024,
        )
        .await
        .unwrap()
    }

    fn writer(retry: bool) -> ResponseWriter {
        ResponseWriter::new(Arc::new(CacheStats::new()), retry)
    }

    fn range(value: &str) -> Option<RangeHeader> {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        HeaderDirectives::parse(&headers).range.map(|r| r.unwrap())
    }

    #[tokio::test]
    async fn test_full_body_with_headers() {
        let req = request(Method::GET).await;
        let w = writer(false);
        let response = w
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_LENGTH], "36");
        assert_eq!(headers[header::VIA], VIA);
        assert_eq!(headers[header::ETAG], "\"x\"");
        assert!(headers.contains_key(header::AGE));
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(headers[CACHE_STATUS].to_str().unwrap().starts_with("reservoir; hit"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], BODY);
        assert_eq!(w.stats.snapshot().bytes_served, 36);
    }

    #[tokio::test]
    async fn test_partial_content() {
        let req = request(Method::GET).await;
        let response = writer(false)
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), range("bytes=10-19"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 10-19/36");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_suffix_range_covers_whole_body() {
        let req = request(Method::GET).await;
        let response = writer(false)
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), range("bytes=-36"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-35/36");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let req = request(Method::GET).await;
        let result = writer(false)
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), range("bytes=-37"))
            .await;
        assert!(matches!(
            result,
            Err(ProxyError::Range {
                source: RangeError::OutOfBounds,
                size: Some(36)
            })
        ));
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_retried_as_full() {
        let req = request(Method::GET).await;
        let response = writer(true)
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), range("bytes=40-50"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "36");
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let req = request(Method::HEAD).await;
        let response = writer(false)
            .cached(&req, entry(), CacheStatus::new(HitStatus::Hit), None)
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "36");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_not_modified() {
        let e = entry();
        let response = writer(false).not_modified(&e, &CacheStatus::new(HitStatus::Hit));
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[header::ETAG], "\"x\"");
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn test_direct_strips_hop_by_hop() {
        let req = request(Method::GET).await;
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"from ")), Ok(Bytes::from_static(b"origin"))];
        let response = DirectResponse {
            status: StatusCode::OK,
            headers,
            body: futures::stream::iter(chunks).boxed(),
        };

        let w = writer(false);
        let response = w.direct(&req, response, CacheStatus::new(HitStatus::Miss));
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::CONNECTION));
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::VIA], VIA);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"from origin");
        assert_eq!(w.stats.snapshot().bytes_served, 11);
    }
}
