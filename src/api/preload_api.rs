use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::PreloadConfig;
use crate::engine::scheduler::{Admission, PreloadScheduler};
use crate::proxy::file_proxy::FileCacheProxy;
use crate::proxy::traits::CacheProxy;

/// Process-level preload context. Build it once at startup and share the scheduler handle.
pub struct PreloadEngine {
    config: PreloadConfig,
    scheduler: Arc<PreloadScheduler>,
}

impl PreloadEngine {
    /// Wire a `FileCacheProxy` over `config.cache_dir` / `config.proxy_base_url`.
    ///
    /// Creates the cache directory with blocking filesystem calls; call it at
    /// startup rather than from a latency-sensitive task.
    pub fn start(config: PreloadConfig) -> Result<Self> {
        if config.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir must be set"));
        }
        std::fs::create_dir_all(Path::new(&config.cache_dir))?;

        let proxy = Arc::new(
            FileCacheProxy::new(config.cache_dir.clone(), &config.proxy_base_url)
                .with_headers(config.source_headers.clone()),
        );
        info!(
            "preload engine cache_dir={} proxy={}",
            config.cache_dir, config.proxy_base_url
        );
        Self::with_proxy(proxy, config)
    }

    /// Use a custom caching-proxy adapter.
    pub fn with_proxy(proxy: Arc<dyn CacheProxy>, config: PreloadConfig) -> Result<Self> {
        let scheduler = Arc::new(PreloadScheduler::new(proxy, config.clone())?);
        Ok(Self { config, scheduler })
    }

    pub fn scheduler(&self) -> Arc<PreloadScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    /// Preload `url` with the configured default percent.
    pub async fn preload(&self, url: &str) -> Admission {
        self.scheduler
            .add_preload_task(url, self.config.default_percent as u32)
            .await
    }

    pub async fn play_url(&self, url: &str) -> String {
        self.scheduler.play_url(url).await
    }

    /// Cancel every preload and release the engine.
    pub fn dispose(self) {
        self.scheduler.remove_all_preload_tasks();
        info!("preload engine disposed");
    }
}
