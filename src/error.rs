//! Error types for the caching proxy
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::cache::Consumed;
use crate::http::cache_status::{CacheStatus, Forward};

// == Cache Error Enum ==
/// Errors raised by the cache backends.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key not present in the backend. Expected control flow, not a failure.
    #[error("cache miss")]
    Miss,

    /// Disk open/read/write/rename failure
    #[error("backend I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory backend would exceed its configured cap
    #[error("memory limit exceeded: {requested} bytes requested, limit is {limit} bytes")]
    MemoryExceeded { requested: u64, limit: u64 },

    /// Sidecar metadata could not be encoded or decoded
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A write failed after part of the body was read from its source
    #[error("{source}")]
    Unfinished {
        source: Box<CacheError>,
        consumed: Consumed,
    },
}

impl CacheError {
    /// True for the expected `Miss` case.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }

    /// Attaches the bytes already read from the body. An empty `consumed`
    /// leaves the error unchanged.
    pub fn after_reading(self, consumed: Consumed) -> Self {
        match self {
            CacheError::Unfinished { .. } => self,
            _ if consumed.is_empty() => self,
            source => CacheError::Unfinished {
                source: Box::new(source),
                consumed,
            },
        }
    }

    /// The underlying failure, looking through `Unfinished`.
    pub fn cause(&self) -> &CacheError {
        match self {
            CacheError::Unfinished { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Splits off the consumed body bytes, if any.
    pub fn into_parts(self) -> (CacheError, Option<Consumed>) {
        match self {
            CacheError::Unfinished { source, consumed } => (*source, Some(consumed)),
            other => (other, None),
        }
    }
}

// == Range Error Enum ==
/// Errors produced by the single-range grammar and its bound validation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("range unit must be bytes")]
    InvalidUnit,

    #[error("malformed range")]
    InvalidFormat,

    #[error("range bound is not a number")]
    InvalidValue,

    #[error("multiple ranges are not supported")]
    MultipleRanges,

    #[error("range not satisfiable")]
    OutOfBounds,
}

// == Config Error Enum ==
/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// == Proxy Error Enum ==
/// Errors surfaced on the request path.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Request could not be turned into an upstream request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Transport error contacting the origin
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The coalesced fetch this request waited on was abandoned
    #[error("upstream fetch cancelled")]
    Cancelled,

    /// Unsatisfiable or malformed range
    #[error("{source}")]
    Range {
        source: RangeError,
        /// Content length, when known, for `Content-Range: bytes */<size>`
        size: Option<u64>,
    },

    /// Backend failure that could not be absorbed
    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    /// A state the fetch pipeline never produces on its own
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Method this proxy does not handle
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RangeError> for ProxyError {
    fn from(source: RangeError) -> Self {
        ProxyError::Range { source, size: None }
    }
}

impl ProxyError {
    /// HTTP status the error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) | ProxyError::Cancelled => StatusCode::BAD_GATEWAY,
            ProxyError::Range { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ProxyError::Cache(_) | ProxyError::Invariant(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short token naming the failure class, used in `Cache-Status` details.
    pub fn class(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad-request",
            ProxyError::Upstream(_) => "upstream-failure",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Range { .. } => "range-not-satisfiable",
            ProxyError::Cache(_) => "cache-failure",
            ProxyError::Invariant(_) => "invariant-violation",
            ProxyError::NotImplemented(_) => "not-implemented",
            ProxyError::Internal(_) => "internal-error",
        }
    }

    /// Rebuilds an equivalent error for a coalesced follower.
    ///
    /// Errors carry I/O sources that cannot be cloned, so followers receive the
    /// same class with the rendered message.
    pub fn duplicate(&self) -> ProxyError {
        match self {
            ProxyError::BadRequest(msg) => ProxyError::BadRequest(msg.clone()),
            ProxyError::Upstream(msg) => ProxyError::Upstream(msg.clone()),
            ProxyError::Cancelled => ProxyError::Cancelled,
            ProxyError::Range { source, size } => ProxyError::Range {
                source: *source,
                size: *size,
            },
            ProxyError::Cache(err) => ProxyError::Internal(err.to_string()),
            ProxyError::Invariant(msg) => ProxyError::Invariant(msg.clone()),
            ProxyError::NotImplemented(msg) => ProxyError::NotImplemented(msg.clone()),
            ProxyError::Internal(msg) => ProxyError::Internal(msg.clone()),
        }
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let forward = match &self {
            ProxyError::BadRequest(_) | ProxyError::NotImplemented(_) => Forward::Request,
            _ => Forward::Miss,
        };
        let cache_status = CacheStatus::error(forward, self.class());

        let body = match &self {
            ProxyError::Range { .. } => "416 range not satisfiable\n".to_string(),
            ProxyError::Upstream(_) | ProxyError::Cancelled => {
                format!("502 bad gateway: {}\n", self.class())
            }
            _ => format!("{} {}\n", status.as_u16(), self.class()),
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Ok(value) = HeaderValue::from_str(&cache_status.to_string()) {
            headers.insert(crate::http::CACHE_STATUS, value);
        }
        if let ProxyError::Range {
            size: Some(size), ..
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

// == Result Type Alias ==
/// Convenience Result type for the request path.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::Upstream("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::from(RangeError::OutOfBounds).status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ProxyError::Invariant("304 without metadata".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Cache(CacheError::Miss).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_carries_cache_status() {
        let response = ProxyError::Upstream("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let value = response
            .headers()
            .get(crate::http::CACHE_STATUS)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(value.starts_with("reservoir; miss; fwd=miss"));
        assert!(value.contains("detail=\"upstream-failure\""));
    }

    #[test]
    fn test_range_error_sets_content_range() {
        let err = ProxyError::Range {
            source: RangeError::OutOfBounds,
            size: Some(36),
        };
        let response = err.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */36"
        );
    }

    #[test]
    fn test_duplicate_keeps_class() {
        let err = ProxyError::Cache(CacheError::Io(std::io::Error::other("disk gone")));
        let dup = err.duplicate();
        assert_eq!(dup.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(dup.to_string().contains("disk gone"));
    }

    #[test]
    fn test_unfinished_wraps_only_with_consumed_bytes() {
        let untouched = CacheError::Io(std::io::Error::other("disk full"))
            .after_reading(Consumed::buffered(bytes::Bytes::new()));
        assert!(matches!(untouched, CacheError::Io(_)));

        let err = CacheError::MemoryExceeded {
            requested: 5,
            limit: 4,
        }
        .after_reading(Consumed::buffered(bytes::Bytes::from_static(b"hello")));
        assert!(matches!(err, CacheError::Unfinished { .. }));
        assert!(matches!(err.cause(), CacheError::MemoryExceeded { limit: 4, .. }));
        assert!(err.to_string().contains("memory limit exceeded"));

        let (source, consumed) = err.into_parts();
        assert!(matches!(source, CacheError::MemoryExceeded { .. }));
        assert_eq!(consumed.unwrap().len(), 5);
    }
}
