//! Reservoir - A caching forward HTTP/1.1 proxy
//!
//! Stores origin responses in a fingerprint-addressed cache (in memory or on
//! disk), coalesces concurrent misses into one upstream fetch, revalidates
//! stale entries with conditional requests and reports every outcome in an
//! RFC 9211 `Cache-Status` header.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod models;
pub mod proxy;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use proxy::{create_proxy_router, ProxyState};
pub use tasks::spawn_janitor;
