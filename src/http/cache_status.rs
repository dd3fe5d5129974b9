//! RFC 9211 `Cache-Status` synthesis
//!
//! ```text
//! reservoir; <hit|miss|hit; detail="revalidated">[; fwd=..][; fwd-status=n][; stored|collapsed][; ttl=s]
//! ```

use std::fmt;

use chrono::{DateTime, Utc};

use super::CACHE_NAME;

/// How the cache answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitStatus {
    Hit,
    Revalidated,
    Miss,
}

/// Why the request went forward to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Nothing usable was stored
    Miss,
    /// The response was not eligible for caching
    Bypass,
    /// A stored response was stale and revalidated
    Stale,
    /// The request itself could not be served from cache
    Request,
}

impl Forward {
    fn as_str(self) -> &'static str {
        match self {
            Forward::Miss => "miss",
            Forward::Bypass => "bypass",
            Forward::Stale => "stale",
            Forward::Request => "request",
        }
    }
}

/// A `Cache-Status` value under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    hit: HitStatus,
    forward: Option<Forward>,
    forward_status: Option<u16>,
    stored: bool,
    collapsed: bool,
    ttl: Option<i64>,
    detail: Option<&'static str>,
}

impl CacheStatus {
    /// Starts a value for the given hit status. `Revalidated` implies `fwd=stale`.
    pub fn new(hit: HitStatus) -> Self {
        Self {
            hit,
            forward: (hit == HitStatus::Revalidated).then_some(Forward::Stale),
            forward_status: None,
            stored: false,
            collapsed: false,
            ttl: None,
            detail: None,
        }
    }

    /// Status for an error response.
    pub fn error(forward: Forward, class: &'static str) -> Self {
        Self {
            detail: Some(class),
            ..Self::new(HitStatus::Miss).forward(forward)
        }
    }

    pub fn forward(mut self, forward: Forward) -> Self {
        if self.hit != HitStatus::Revalidated {
            self.forward = Some(forward);
        }
        self
    }

    /// Upstream status; only meaningful on miss and revalidation paths.
    pub fn forward_status(mut self, status: Option<u16>) -> Self {
        if self.hit != HitStatus::Hit {
            self.forward_status = status;
        }
        self
    }

    /// Marks the response as newly stored. Ignored for coalesced followers.
    pub fn stored(mut self, stored: bool) -> Self {
        self.stored = stored && !self.collapsed;
        self
    }

    /// Marks the response as served to a coalesced follower.
    pub fn collapsed(mut self, collapsed: bool) -> Self {
        self.collapsed = collapsed;
        if collapsed {
            self.stored = false;
        }
        self
    }

    /// Remaining freshness; emitted for hit and revalidated only.
    pub fn ttl(mut self, expires: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if self.hit != HitStatus::Miss {
            let seconds = (expires - now).num_seconds();
            self.ttl = Some(seconds.max(0));
        }
        self
    }

    pub fn hit_status(&self) -> HitStatus {
        self.hit
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn is_collapsed(&self) -> bool {
        self.collapsed
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(CACHE_NAME)?;
        match self.hit {
            HitStatus::Hit => f.write_str("; hit")?,
            HitStatus::Revalidated => f.write_str("; hit; detail=\"revalidated\"")?,
            HitStatus::Miss => f.write_str("; miss")?,
        }
        if let Some(forward) = self.forward {
            write!(f, "; fwd={}", forward.as_str())?;
        }
        if let Some(status) = self.forward_status {
            write!(f, "; fwd-status={}", status)?;
        }
        if self.stored {
            f.write_str("; stored")?;
        } else if self.collapsed {
            f.write_str("; collapsed")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, "; ttl={}", ttl)?;
        }
        if let Some(detail) = self.detail {
            write!(f, "; detail=\"{}\"", detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_miss_stored() {
        let status = CacheStatus::new(HitStatus::Miss)
            .forward(Forward::Miss)
            .forward_status(Some(200))
            .stored(true);
        assert_eq!(
            status.to_string(),
            "reservoir; miss; fwd=miss; fwd-status=200; stored"
        );
    }

    #[test]
    fn test_hit_ttl() {
        let now = Utc::now();
        let status = CacheStatus::new(HitStatus::Hit)
            .forward_status(Some(200))
            .ttl(now + Duration::seconds(60), now);
        assert_eq!(status.to_string(), "reservoir; hit; ttl=60");
    }

    #[test]
    fn test_revalidated() {
        let now = Utc::now();
        let status = CacheStatus::new(HitStatus::Revalidated)
            .forward(Forward::Miss)
            .forward_status(Some(304))
            .stored(true)
            .ttl(now + Duration::seconds(30), now);
        assert_eq!(
            status.to_string(),
            "reservoir; hit; detail=\"revalidated\"; fwd=stale; fwd-status=304; stored; ttl=30"
        );
    }

    #[test]
    fn test_ttl_never_negative_and_absent_on_miss() {
        let now = Utc::now();
        let hit = CacheStatus::new(HitStatus::Hit).ttl(now - Duration::seconds(5), now);
        assert_eq!(hit.to_string(), "reservoir; hit; ttl=0");

        let miss = CacheStatus::new(HitStatus::Miss).ttl(now + Duration::seconds(5), now);
        assert_eq!(miss.to_string(), "reservoir; miss");
    }

    #[test]
    fn test_collapsed_never_stored() {
        let a = CacheStatus::new(HitStatus::Miss).stored(true).collapsed(true);
        let b = CacheStatus::new(HitStatus::Miss).collapsed(true).stored(true);
        for status in [a, b] {
            assert!(!status.is_stored());
            let text = status.to_string();
            assert!(text.contains("collapsed"));
            assert!(!text.contains("stored"));
        }
    }

    #[test]
    fn test_error_detail() {
        let status = CacheStatus::error(Forward::Miss, "upstream-failure");
        assert_eq!(
            status.to_string(),
            "reservoir; miss; fwd=miss; detail=\"upstream-failure\""
        );
    }
}
