//! # Cache System
//!
//! Downloaded files live in a single directory, one file per cache key.
//! Keys are derived from the canonical URL so that every process instance
//! agrees on where a resource ends up.

mod key;
mod store;

pub use key::{CacheKey, derive_key};
pub use store::LocalCacheStore;
