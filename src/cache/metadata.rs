//! Entry Metadata Module
//!
//! Per-entry bookkeeping shared by both backends and persisted as the disk
//! sidecar. Timestamps serialize as RFC 3339.

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::http::directives::parse_http_date;

// == Payload ==
/// User payload carried alongside each entry.
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

// == Entry Metadata ==
/// Metadata stored for one cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata<P> {
    pub time_written: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    /// Body length in bytes; fixed once written
    #[serde(rename = "file_size")]
    pub size: i64,
    pub object: P,
}

impl<P> EntryMetadata<P> {
    /// Metadata for a body of `size` bytes written at `now`.
    pub fn new(now: DateTime<Utc>, expires: DateTime<Utc>, size: i64, object: P) -> Self {
        Self {
            time_written: now,
            last_access: now,
            expires,
            size,
            object,
        }
    }

    /// Boundary condition: an entry is stale once `now >= expires`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Records an access without ever moving `last_access` backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_access {
            self.last_access = now;
        }
    }

    /// Whole seconds of freshness left, zero once stale.
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> u64 {
        (self.expires - now).num_seconds().max(0) as u64
    }
}

// == Object Info ==
/// Header multi-map in a serde-friendly shape: lowercase name to values.
pub type HeaderMultiMap = BTreeMap<String, Vec<String>>;

/// The payload this proxy stores per response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Origin `ETag`, empty if none
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub header: HeaderMultiMap,
}

impl ObjectInfo {
    /// Captures validators and headers of an origin response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let mut header = HeaderMultiMap::new();
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                header
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        Self {
            etag,
            last_modified,
            header,
        }
    }

    /// Rebuilds the stored headers; entries that no longer parse are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.header {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}
