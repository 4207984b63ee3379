//! Stable 128-bit content key derived from a request URL.

use md5::{Digest, Md5};
use std::fmt;

/// A 128-bit digest of a canonical request URL, rendered as 32 lowercase hex
/// characters. Two URLs that hash the same are treated as the same cached
/// resource; collisions are a bug, not a case this type handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Hash a URL into its cache key. Deterministic: the same bytes always
    /// produce the same key.
    pub fn from_url(url: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a key back from its hex representation (e.g. a directory or
    /// file stem found while enumerating the cache root).
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let decoded = hex::decode(hex_str).ok()?;
        if decoded.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&decoded);
        Some(Self(bytes))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
