//! RFC 7234 age calculation for stored responses.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};

use super::directives::parse_http_date;

/// Current age in seconds of a response stored at `stored_at`.
///
/// `headers` are the origin's response headers; `Date` and `Age` are read from
/// them. The request delay is not tracked, so `response_delay` is zero.
pub fn current_age(headers: &HeaderMap, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let date = headers
        .get(header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    let age_value = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let apparent_age = date
        .map(|date| (stored_at - date).num_seconds().max(0) as u64)
        .unwrap_or(0);
    let corrected_initial_age = apparent_age.max(age_value);
    let resident_time = (now - stored_at).num_seconds().max(0) as u64;

    corrected_initial_age.saturating_add(resident_time)
}
