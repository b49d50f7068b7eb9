use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Percentage of each file preloaded when the caller doesn't say otherwise.
pub const DEFAULT_PRELOAD_PERCENT: u8 = 20;

/// A completed cache file smaller than this (1 KB) is treated as corrupt.
pub const MIN_VALID_CACHE_BYTES: u64 = 1024;

/// Connect timeout for the ranged request against the proxy.
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on waiting for response headers or a single body read.
pub const READ_TIMEOUT_MS: u64 = 5_000;

/// Size of each body read while preloading (8 KB).
pub const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Worker permits shared by all preload tasks.
pub const WORKER_THREADS: usize = 2;

/// Number of preloads allowed to run at the same time.
pub const MAX_CONCURRENT_PRELOADS: usize = 1;

/// Buffered lifecycle events per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 64;

/// Top-level configuration for the preload engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Percent used by `play_url` when no task exists for a URL.
    pub default_percent: u8,
    /// Completed cache files below this size are discarded.
    pub min_valid_cache_bytes: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub read_chunk_bytes: usize,
    pub worker_threads: usize,
    pub max_concurrent_preloads: usize,
    pub event_capacity: usize,
    /// Directory the caching proxy writes its files to.
    pub cache_dir: String,
    /// Base URL of the local caching proxy, without a trailing slash.
    pub proxy_base_url: String,
    /// Extra headers sent to origins when asking for their length (auth, referer).
    pub source_headers: HashMap<String, String>,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            default_percent: DEFAULT_PRELOAD_PERCENT,
            min_valid_cache_bytes: MIN_VALID_CACHE_BYTES,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            read_chunk_bytes: READ_CHUNK_BYTES,
            worker_threads: WORKER_THREADS,
            max_concurrent_preloads: MAX_CONCURRENT_PRELOADS,
            event_capacity: EVENT_CAPACITY,
            cache_dir: String::new(),
            proxy_base_url: "http://127.0.0.1:0".to_string(),
            source_headers: HashMap::new(),
        }
    }
}

impl PreloadConfig {
    /// Parse a JSON document; missing fields fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid preload config")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Soft cap on running preloads, never below one.
    pub fn max_active(&self) -> usize {
        self.max_concurrent_preloads.max(1)
    }
}
