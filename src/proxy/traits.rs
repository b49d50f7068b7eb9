use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Narrow view of the local caching proxy that preloading relies on.
///
/// The proxy owns the on-disk cache and the HTTP range serving; preloading only
/// inspects its files and pulls bytes through `proxy_url`.
#[async_trait]
pub trait CacheProxy: Send + Sync {
    /// Local URL that fetches-and-caches `source_url` when range-requested.
    fn proxy_url(&self, source_url: &str) -> String;

    /// Location of the completed cache file.
    fn cache_file_path(&self, source_url: &str) -> PathBuf;

    /// Location of the partial cache file while a download is incomplete.
    fn temp_cache_file_path(&self, source_url: &str) -> PathBuf;

    async fn is_fully_cached(&self, source_url: &str) -> Result<bool>;

    /// Authoritative total byte length of the source.
    async fn source_content_length(&self, source_url: &str) -> Result<u64>;

    /// Bytes already cached from the start of the source.
    async fn cached_length(&self, source_url: &str) -> Result<u64> {
        for path in [
            self.cache_file_path(source_url),
            self.temp_cache_file_path(source_url),
        ] {
            if let Some(len) = file_len(&path).await? {
                return Ok(len);
            }
        }
        Ok(0)
    }

    /// Remove a cache artifact. A missing file is not an error.
    async fn delete_cache_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

/// Size of the file at `path`, or `None` when it doesn't exist.
pub async fn file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}
