//! # Local Cache Store
//!
//! A flat directory holding one file per cache key. Files only appear through
//! [`LocalCacheStore::publish`], which moves a finished download into place.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs;
use tracing::{debug, warn};

use crate::cache::key::CacheKey;
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl LocalCacheStore {
    /// Create a store rooted at the specified directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create the cache directory if it does not exist yet
    pub async fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| StoreError::io(&self.cache_dir, e))?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Location of the cached file for a key, whether or not it exists
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.to_filename())
    }

    /// Check whether a cached file exists for the key.
    ///
    /// I/O errors are logged and reported as "not present".
    pub async fn exists(&self, key: &CacheKey) -> bool {
        let path = self.path_for(key);
        match fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to check cached file, treating as absent");
                false
            }
        }
    }

    /// Move `source` into the store under `key`, replacing any existing file.
    pub async fn publish(&self, source: &Path, key: &CacheKey) -> Result<PathBuf, StoreError> {
        match fs::try_exists(source).await {
            Ok(true) => {}
            Ok(false) => return Err(StoreError::SourceMissing(source.to_path_buf())),
            Err(e) => return Err(StoreError::io(source, e)),
        }

        self.ensure_initialized().await?;

        let dest = self.path_for(key);
        match fs::remove_file(&dest).await {
            Ok(()) => debug!(path = ?dest, "Replacing existing cached file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&dest, e)),
        }

        match fs::rename(source, &dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                // Staging directory lives on another filesystem
                self.copy_into_place(source, &dest).await?;
            }
            Err(e) => {
                warn!(from = ?source, to = ?dest, error = %e, "Failed to move file into cache");
                return Err(StoreError::io(&dest, e));
            }
        }

        debug!(key = %key, path = ?dest, "Published file to cache");
        Ok(dest)
    }

    async fn copy_into_place(&self, source: &Path, dest: &Path) -> Result<(), StoreError> {
        let temp_dest = dest.with_extension("tmp");
        fs::copy(source, &temp_dest)
            .await
            .map_err(|e| StoreError::io(&temp_dest, e))?;

        if let Err(e) = fs::rename(&temp_dest, dest).await {
            let _ = fs::remove_file(&temp_dest).await;
            return Err(StoreError::io(dest, e));
        }

        if let Err(e) = fs::remove_file(source).await {
            warn!(path = ?source, error = %e, "Failed to remove staged file after copy");
        }
        Ok(())
    }

    /// Delete every file in the store directory
    pub async fn purge_all(&self) -> Result<usize, StoreError> {
        self.purge_except(&HashSet::new()).await
    }

    /// Delete every file in the store directory except those named by `keep`.
    ///
    /// Individual removal failures are logged and skipped. Returns the number
    /// of entries removed.
    pub async fn purge_except(&self, keep: &HashSet<CacheKey>) -> Result<usize, StoreError> {
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                warn!(dir = ?self.cache_dir, error = %e, "Failed to read cache directory");
                return Err(StoreError::io(&self.cache_dir, e));
            }
        };

        let keep: HashSet<&str> = keep.iter().map(CacheKey::to_filename).collect();
        let mut removed = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.cache_dir, e))?
        {
            let path = entry.path();
            let retained = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| keep.contains(name));
            if retained {
                continue;
            }

            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove cache entry"),
            }
        }

        debug!(count = removed, dir = ?self.cache_dir, "Purged cache entries");
        Ok(removed)
    }
}
