//! # Cache Keys

use std::fmt;

use sha2::{Digest, Sha256};

use crate::request::ResourceId;

/// Filesystem-safe key for a cached resource: the lowercase hex SHA-256 of
/// the resource identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Use the key as a file name
    pub fn to_filename(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the cache key for a resource.
///
/// Only the canonical URL text is hashed, never headers or timing.
pub fn derive_key(resource: &ResourceId) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(resource.as_str().as_bytes());
    CacheKey(hex::encode(hasher.finalize()))
}
