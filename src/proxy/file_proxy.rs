// Adapter for a local caching proxy that stores one file per source URL.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::traits::{file_len, CacheProxy};
use crate::source::http_source::HttpSource;

/// Suffix the proxy appends to a file while it is still downloading.
pub const TEMP_FILE_SUFFIX: &str = ".download";

pub struct FileCacheProxy {
    cache_dir: PathBuf,
    proxy_base_url: String,
    client: Client,
    headers: HashMap<String, String>,
    lengths: RwLock<HashMap<String, u64>>,
}

impl FileCacheProxy {
    pub fn new(cache_dir: impl Into<PathBuf>, proxy_base_url: &str) -> Self {
        Self::with_client(Client::new(), cache_dir, proxy_base_url)
    }

    pub fn with_client(client: Client, cache_dir: impl Into<PathBuf>, proxy_base_url: &str) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            proxy_base_url: proxy_base_url.trim_end_matches('/').to_string(),
            client,
            headers: HashMap::new(),
            lengths: RwLock::new(HashMap::new()),
        }
    }

    /// Extra headers sent to the origin when probing (auth tokens, referer).
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Cache file name: hex SHA-256 of the URL plus the URL's short extension, if any.
pub fn cache_file_name(source_url: &str) -> String {
    let digest = Sha256::digest(source_url.as_bytes());
    let name = format!("{:x}", digest);
    match url_extension(source_url) {
        Some(ext) => format!("{}.{}", name, ext),
        None => name,
    }
}

fn url_extension(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let valid = (1..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

#[async_trait]
impl CacheProxy for FileCacheProxy {
    fn proxy_url(&self, source_url: &str) -> String {
        format!(
            "{}/{}",
            self.proxy_base_url,
            urlencoding::encode(source_url)
        )
    }

    fn cache_file_path(&self, source_url: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(source_url))
    }

    fn temp_cache_file_path(&self, source_url: &str) -> PathBuf {
        let name = format!("{}{}", cache_file_name(source_url), TEMP_FILE_SUFFIX);
        self.cache_dir.join(name)
    }

    async fn is_fully_cached(&self, source_url: &str) -> Result<bool> {
        Ok(file_len(&self.cache_file_path(source_url)).await?.is_some())
    }

    async fn source_content_length(&self, source_url: &str) -> Result<u64> {
        let known = self.lengths.read().get(source_url).copied();
        if let Some(len) = known {
            return Ok(len);
        }

        let source = HttpSource::with_client(
            self.client.clone(),
            source_url.to_string(),
            self.headers.clone(),
        );
        let info = source.probe().await?;
        if info.content_length == 0 {
            return Err(anyhow!("unknown content length for {}", source_url));
        }
        debug!(
            "source length url={} bytes={} type={} range={}",
            source_url, info.content_length, info.content_type, info.supports_range
        );

        self.lengths
            .write()
            .insert(source_url.to_string(), info.content_length);
        Ok(info.content_length)
    }
}
