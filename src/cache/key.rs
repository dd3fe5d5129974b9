//! Cache Key Module
//!
//! Fingerprints a request's identity tuple into a 32-byte BLAKE2b digest.

use std::fmt;
use std::str::FromStr;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

// == Cache Key ==
/// Digest of `scheme|lower(host)|method|clean(path)|raw_query`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derives the key from the request identity tuple.
    pub fn from_parts(scheme: &str, host: &str, method: &str, path: &str, query: &str) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(scheme.as_bytes());
        hasher.update(b"|");
        hasher.update(host.to_ascii_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(method.as_bytes());
        hasher.update(b"|");
        hasher.update(clean_path(path).as_bytes());
        hasher.update(b"|");
        hasher.update(query.as_bytes());

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex; also the on-disk file name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as a big-endian integer, used for shard selection.
    pub fn prefix_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// == Path Cleaning ==
/// Lexically collapses `.`, `..` and repeated slashes. `..` never escapes the root.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
