//! Single byte-range grammar
//!
//! Recognizes `bytes=<start>-<end>`, `bytes=<start>-` and `bytes=-<suffix>`.
//! Bounds are validated against the content length only in [`RangeHeader::slice_size`].

use crate::error::RangeError;

/// A parsed single byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeHeader {
    /// `bytes=<start>-<end>`, both inclusive
    Bounded { start: u64, end: u64 },
    /// `bytes=<start>-`
    From { start: u64 },
    /// `bytes=-<suffix>`, the last `suffix` bytes
    Suffix { length: u64 },
}

impl RangeHeader {
    /// Parses a `Range` header value.
    pub fn parse(value: &str) -> Result<Self, RangeError> {
        let value = value.trim();
        let (unit, spec) = value.split_once('=').ok_or(RangeError::InvalidFormat)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(RangeError::InvalidUnit);
        }
        if spec.contains(',') {
            return Err(RangeError::MultipleRanges);
        }
        let (start, end) = spec.trim().split_once('-').ok_or(RangeError::InvalidFormat)?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(RangeError::InvalidFormat),
            (true, false) => Ok(RangeHeader::Suffix {
                length: parse_bound(end)?,
            }),
            (false, true) => Ok(RangeHeader::From {
                start: parse_bound(start)?,
            }),
            (false, false) => Ok(RangeHeader::Bounded {
                start: parse_bound(start)?,
                end: parse_bound(end)?,
            }),
        }
    }

    /// Resolves the range against `data_len`, returning inclusive `(start, end)`.
    ///
    /// This is the single point of bound validation.
    pub fn slice_size(&self, data_len: u64) -> Result<(u64, u64), RangeError> {
        let (start, end) = match *self {
            RangeHeader::Bounded { start, end } => (start, end),
            RangeHeader::From { start } => (start, data_len.saturating_sub(1)),
            RangeHeader::Suffix { length } => {
                if length == 0 || length > data_len {
                    return Err(RangeError::OutOfBounds);
                }
                (data_len - length, data_len - 1)
            }
        };
        if data_len == 0 || start > end || start >= data_len || end >= data_len {
            return Err(RangeError::OutOfBounds);
        }
        Ok((start, end))
    }
}

impl std::fmt::Display for RangeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeHeader::Bounded { start, end } => write!(f, "bytes={}-{}", start, end),
            RangeHeader::From { start } => write!(f, "bytes={}-", start),
            RangeHeader::Suffix { length } => write!(f, "bytes=-{}", length),
        }
    }
}

fn parse_bound(value: &str) -> Result<u64, RangeError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::InvalidValue);
    }
    value.parse().map_err(|_| RangeError::InvalidValue)
}
