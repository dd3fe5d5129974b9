//! Header Directives Module
//!
//! Parses `Cache-Control`, `Expires`, the conditional request headers and
//! `Range` out of a header map, and decides whether a response is storable.

use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};

use crate::error::RangeError;
use crate::http::range::RangeHeader;

// == Cache Policy ==
/// Operator knobs that bend the freshness rules.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Lifetime used when the origin gives none, and on every 304 refresh
    pub default_max_age: Duration,
    /// Always use `default_max_age`, whatever the origin says
    pub force_default_max_age: bool,
    /// Store responses even when `Cache-Control` forbids it
    pub ignore_cache_control: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_max_age: Duration::from_secs(3600),
            force_default_max_age: false,
            ignore_cache_control: false,
        }
    }
}

// == Cache-Control ==
/// The `Cache-Control` directives the cache acts on. Unknown directives are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// Set by `no-cache`, `no-store`, or a `max-age` below one second
    pub no_cache: bool,
    pub max_age: Option<Duration>,
}

impl CacheControl {
    /// Parses a comma-separated directive list.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-cache" || directive == "no-store" {
                cc.no_cache = true;
            } else if let Some(seconds) = directive.strip_prefix("max-age=") {
                // a malformed max-age is treated as absent
                if let Ok(seconds) = seconds.trim_matches('"').parse::<u64>() {
                    let max_age = Duration::from_secs(seconds);
                    if max_age < Duration::from_secs(1) {
                        cc.no_cache = true;
                    }
                    cc.max_age = Some(max_age);
                }
            }
        }

        cc
    }
}

impl std::fmt::Display for CacheControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={}", max_age.as_secs()));
        }
        f.write_str(&parts.join(", "))
    }
}

// == Conditionals ==
/// `If-Range` carries either an entity tag or a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfRange {
    ETag(String),
    Date(DateTime<Utc>),
}

/// Conditional request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditionals {
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub if_none_match: Option<String>,
    pub if_match: Option<String>,
    pub if_range: Option<IfRange>,
}

/// Outcome of evaluating client preconditions against a stored validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

impl Conditionals {
    /// True if any conditional header was present.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Evaluates preconditions in RFC 9110 order against a stored representation.
    pub fn evaluate(&self, etag: &str, last_modified: Option<DateTime<Utc>>) -> Precondition {
        if let Some(list) = &self.if_match {
            if !etag_list_matches(list, etag, strong_eq) {
                return Precondition::Failed;
            }
        } else if let (Some(since), Some(modified)) = (self.if_unmodified_since, last_modified) {
            if modified > since {
                return Precondition::Failed;
            }
        }

        if let Some(list) = &self.if_none_match {
            if etag_list_matches(list, etag, weak_eq) {
                return Precondition::NotModified;
            }
        } else if let (Some(since), Some(modified)) = (self.if_modified_since, last_modified) {
            if modified <= since {
                return Precondition::NotModified;
            }
        }

        Precondition::Proceed
    }

    /// True if a `Range` may be honoured: no `If-Range`, or it matches the validator.
    pub fn if_range_matches(&self, etag: &str, last_modified: Option<DateTime<Utc>>) -> bool {
        match &self.if_range {
            None => true,
            Some(IfRange::ETag(tag)) => strong_eq(tag, etag),
            Some(IfRange::Date(date)) => last_modified == Some(*date),
        }
    }
}

fn etag_list_matches(list: &str, etag: &str, eq: fn(&str, &str) -> bool) -> bool {
    if etag.is_empty() {
        return false;
    }
    list.split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || eq(candidate, etag))
}

fn strong_eq(a: &str, b: &str) -> bool {
    !a.starts_with("W/") && !b.starts_with("W/") && a == b
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

// == Header Directives ==
/// Everything the cache reads out of a header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderDirectives {
    pub cache_control: Option<CacheControl>,
    pub expires: Option<DateTime<Utc>>,
    pub conditional: Conditionals,
    /// `None` when absent; a malformed header is kept as its error
    pub range: Option<Result<RangeHeader, RangeError>>,
}

impl HeaderDirectives {
    /// Parses directives from a header multi-map. Unparsable values are treated as absent.
    pub fn parse(headers: &HeaderMap) -> Self {
        let cache_control = joined(headers, header::CACHE_CONTROL).map(|v| CacheControl::parse(&v));

        let if_range = header_str(headers, header::IF_RANGE).map(|value| {
            match parse_http_date(value) {
                Some(date) => IfRange::Date(date),
                None => IfRange::ETag(value.trim().to_string()),
            }
        });

        let conditional = Conditionals {
            if_modified_since: header_str(headers, header::IF_MODIFIED_SINCE)
                .and_then(parse_http_date),
            if_unmodified_since: header_str(headers, header::IF_UNMODIFIED_SINCE)
                .and_then(parse_http_date),
            if_none_match: joined(headers, header::IF_NONE_MATCH),
            if_match: joined(headers, header::IF_MATCH),
            if_range,
        };

        let range = headers.get(header::RANGE).map(|value| {
            value
                .to_str()
                .map_err(|_| RangeError::InvalidFormat)
                .and_then(RangeHeader::parse)
        });

        Self {
            cache_control,
            expires: header_str(headers, header::EXPIRES).and_then(parse_http_date),
            conditional,
            range,
        }
    }

    /// Whether a response carrying these directives may be stored.
    pub fn should_cache(&self, now: DateTime<Utc>, policy: &CachePolicy) -> bool {
        let cache_control_allows = match &self.cache_control {
            None => true,
            Some(_) if policy.ignore_cache_control => true,
            Some(cc) => !cc.no_cache,
        };
        let not_expired = self.expires.map_or(true, |expires| expires > now);

        cache_control_allows && not_expired && self.range.is_none()
    }

    /// Expiry instant for a response stored at `now`.
    pub fn expires_or_default(&self, now: DateTime<Utc>, policy: &CachePolicy) -> DateTime<Utc> {
        if policy.force_default_max_age {
            return add_duration(now, policy.default_max_age);
        }
        let max_age = self
            .cache_control
            .as_ref()
            .filter(|_| !policy.ignore_cache_control)
            .and_then(|cc| cc.max_age)
            .filter(|max_age| !max_age.is_zero());
        if let Some(max_age) = max_age {
            return add_duration(now, max_age);
        }
        if let Some(expires) = self.expires {
            return expires;
        }
        add_duration(now, policy.default_max_age)
    }

    /// Renders the directives back into headers.
    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: header::HeaderName, value: String| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        };

        if let Some(cc) = &self.cache_control {
            put(header::CACHE_CONTROL, cc.to_string());
        }
        if let Some(expires) = self.expires {
            put(header::EXPIRES, format_http_date(expires));
        }
        let c = &self.conditional;
        if let Some(date) = c.if_modified_since {
            put(header::IF_MODIFIED_SINCE, format_http_date(date));
        }
        if let Some(date) = c.if_unmodified_since {
            put(header::IF_UNMODIFIED_SINCE, format_http_date(date));
        }
        if let Some(tags) = &c.if_none_match {
            put(header::IF_NONE_MATCH, tags.clone());
        }
        if let Some(tags) = &c.if_match {
            put(header::IF_MATCH, tags.clone());
        }
        match &c.if_range {
            Some(IfRange::ETag(tag)) => put(header::IF_RANGE, tag.clone()),
            Some(IfRange::Date(date)) => put(header::IF_RANGE, format_http_date(*date)),
            None => {}
        }
        if let Some(Ok(range)) = &self.range {
            put(header::RANGE, range.to_string());
        }
        headers
    }
}

// == Date Helpers ==
/// Parses an HTTP-date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(value.trim())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Formats an instant as an HTTP-date (second precision).
pub fn format_http_date(instant: DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(instant))
}

/// `now + duration`, saturating at the largest representable instant.
pub fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn joined(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}
