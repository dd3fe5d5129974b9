//! HTTP Semantics Module
//!
//! Header directive parsing, the single-range grammar, RFC 9211 `Cache-Status`
//! synthesis and RFC 7234 age calculation.

pub mod age;
pub mod cache_status;
pub mod directives;
pub mod range;

pub use age::current_age;
pub use cache_status::{CacheStatus, Forward, HitStatus};
pub use directives::{CacheControl, CachePolicy, Conditionals, HeaderDirectives, Precondition};
pub use range::RangeHeader;

use axum::http::header::{self, HeaderMap, HeaderName};

// == Header Names ==
/// RFC 9211 response header.
pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");

/// Identifier used in `Cache-Status` and `Via`.
pub const CACHE_NAME: &str = "reservoir";

/// Connection-scoped headers never forwarded in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Conditional request headers; the proxy regenerates its own.
pub const CONDITIONALS: &[&str] = &[
    "if-modified-since",
    "if-unmodified-since",
    "if-none-match",
    "if-match",
    "if-range",
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in named {
        headers.remove(name.as_str());
    }
    let proxy_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("proxy-"))
        .cloned()
        .collect();
    for name in proxy_headers {
        headers.remove(name);
    }
}

/// Removes client conditional headers.
pub fn strip_conditionals(headers: &mut HeaderMap) {
    for name in CONDITIONALS {
        headers.remove(*name);
    }
}
