// A single preload: pull the leading percent of one source through the proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::TryStreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::event::{FailureKind, PreloadOutcome};
use crate::config::PreloadConfig;
use crate::proxy::traits::CacheProxy;

/// Bytes that make up `percent` of `total`, rounded down.
pub fn target_length(total: u64, percent: u8) -> u64 {
    (total as u128 * percent.min(100) as u128 / 100) as u64
}

/// Range header for the leading `target` bytes (inclusive end, as the proxy expects).
pub fn range_header(target: u64) -> String {
    format!("bytes=0-{}", target)
}

/// What the caller asked for. One outstanding request per URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadRequest {
    pub source_url: String,
    pub target_percent: u8,
}

impl PreloadRequest {
    /// Percentages above 100 are clamped.
    pub fn new(source_url: impl Into<String>, percent: u32) -> Self {
        let source_url = source_url.into();
        if percent > 100 {
            warn!("preload percent {} clamped to 100 url={}", percent, source_url);
        }
        Self {
            source_url,
            target_percent: percent.min(100) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Timeouts and buffer sizing for the ranged read.
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub chunk_bytes: usize,
}

impl From<&PreloadConfig> for TaskSettings {
    fn from(config: &PreloadConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            chunk_bytes: config.read_chunk_bytes.max(1),
        }
    }
}

/// Resolves once with the task's terminal outcome.
#[derive(Debug)]
pub struct PreloadHandle {
    url: String,
    rx: oneshot::Receiver<PreloadOutcome>,
}

impl PreloadHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the task to finish. A task dropped without completing counts as cancelled.
    pub async fn outcome(self) -> PreloadOutcome {
        self.rx.await.unwrap_or(PreloadOutcome::Cancelled)
    }
}

enum ReadEnd {
    Reached(u64),
    Cancelled(u64),
    Exhausted(u64),
}

pub struct PreloadTask {
    id: u64,
    request: PreloadRequest,
    state: Mutex<TaskState>,
    cancel_token: CancellationToken,
    submitted: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<PreloadOutcome>>>,
}

impl PreloadTask {
    pub(crate) fn new(id: u64, request: PreloadRequest) -> (Self, PreloadHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = PreloadHandle {
            url: request.source_url.clone(),
            rx,
        };
        let task = Self {
            id,
            request,
            state: Mutex::new(TaskState::Queued),
            cancel_token: CancellationToken::new(),
            submitted: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        };
        (task, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.request.source_url
    }

    pub fn percent(&self) -> u8 {
        self.request.target_percent
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Idempotent. A running task stops at its next chunk boundary.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Claim the task for a worker. Fails unless it is queued, live and not yet submitted.
    pub(crate) fn try_submit(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TaskState::Queued || self.is_cancelled() {
            return false;
        }
        if self
            .submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *state = TaskState::Running;
        true
    }

    /// Record the terminal state. Only the first call wins.
    pub(crate) fn mark_finished(&self, outcome: &PreloadOutcome) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = match outcome {
            PreloadOutcome::Succeeded { .. } => TaskState::Succeeded,
            PreloadOutcome::Failed { .. } => TaskState::Failed,
            PreloadOutcome::Cancelled => TaskState::Cancelled,
        };
        true
    }

    /// Hand the outcome to the `PreloadHandle`. Later calls are ignored.
    pub(crate) fn resolve(&self, outcome: PreloadOutcome) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Execute on a worker. Never touches the network once cancelled.
    pub(crate) async fn run(
        &self,
        proxy: &dyn CacheProxy,
        client: &Client,
        settings: &TaskSettings,
    ) -> PreloadOutcome {
        let outcome = if self.is_cancelled() {
            debug!("preload task {} cancelled before start url={}", self.id, self.url());
            PreloadOutcome::Cancelled
        } else {
            self.start(proxy, client, settings).await
        };
        self.submitted.store(false, Ordering::Release);
        outcome
    }

    async fn start(
        &self,
        proxy: &dyn CacheProxy,
        client: &Client,
        settings: &TaskSettings,
    ) -> PreloadOutcome {
        info!(
            "preload start task={} url={} percent={}",
            self.id,
            self.url(),
            self.percent()
        );

        match self.remaining_total(proxy).await {
            Ok(Some(total)) => self.load_range(proxy, client, settings, total).await,
            Ok(None) => PreloadOutcome::Succeeded { bytes_read: 0 },
            Err(e) => {
                warn!("preload task {} cache query failed: {}", self.id, e);
                PreloadOutcome::Failed {
                    kind: FailureKind::Transport,
                    detail: e.to_string(),
                }
            }
        }
    }

    /// Total source length when the cache is still short of the target, `None` otherwise.
    async fn remaining_total(&self, proxy: &dyn CacheProxy) -> Result<Option<u64>, TransportError> {
        let url = self.url();
        if proxy
            .is_fully_cached(url)
            .await
            .map_err(TransportError::Proxy)?
        {
            debug!("preload skipped, fully cached url={}", url);
            return Ok(None);
        }

        let total = proxy
            .source_content_length(url)
            .await
            .map_err(TransportError::Proxy)?;
        let cached = proxy
            .cached_length(url)
            .await
            .map_err(TransportError::Proxy)?;
        let target = target_length(total, self.percent());
        debug!(
            "preload plan url={} total={} cached={} target={}",
            url, total, cached, target
        );

        if cached >= target {
            return Ok(None);
        }
        Ok(Some(total))
    }

    async fn load_range(
        &self,
        proxy: &dyn CacheProxy,
        client: &Client,
        settings: &TaskSettings,
        total: u64,
    ) -> PreloadOutcome {
        let target = target_length(total, self.percent());
        let proxy_url = proxy.proxy_url(self.url());

        match self.stream_range(client, settings, &proxy_url, target).await {
            Ok(ReadEnd::Reached(bytes_read)) => {
                info!(
                    "preload done task={} url={} bytes={}",
                    self.id,
                    self.url(),
                    bytes_read
                );
                PreloadOutcome::Succeeded { bytes_read }
            }
            Ok(ReadEnd::Cancelled(bytes_read)) => {
                info!(
                    "preload cancelled task={} url={} bytes={}",
                    self.id,
                    self.url(),
                    bytes_read
                );
                PreloadOutcome::Cancelled
            }
            Ok(ReadEnd::Exhausted(0)) => {
                info!("preload failed, empty read url={}", self.url());
                self.discard_artifacts(proxy).await;
                PreloadOutcome::Failed {
                    kind: FailureKind::EmptyRead,
                    detail: format!("no bytes received from {}", proxy_url),
                }
            }
            Ok(ReadEnd::Exhausted(bytes_read)) => {
                warn!(
                    "preload stream ended early url={} bytes={} target={}",
                    self.url(),
                    bytes_read,
                    target
                );
                PreloadOutcome::Failed {
                    kind: FailureKind::Incomplete,
                    detail: format!("read {} of {} bytes", bytes_read, target),
                }
            }
            Err(e) => {
                info!("preload aborted url={}: {}", self.url(), e);
                PreloadOutcome::Failed {
                    kind: FailureKind::Transport,
                    detail: e.to_string(),
                }
            }
        }
    }

    /// Read the leading range in fixed-size chunks. The response is dropped on return.
    async fn stream_range(
        &self,
        client: &Client,
        settings: &TaskSettings,
        proxy_url: &str,
        target: u64,
    ) -> Result<ReadEnd, TransportError> {
        let header_timeout = settings.connect_timeout + settings.read_timeout;
        let send = client
            .get(proxy_url)
            .header(header::RANGE, range_header(target))
            .send();

        let resp = tokio::time::timeout(header_timeout, send)
            .await
            .map_err(|_| TransportError::Timeout {
                url: proxy_url.to_string(),
                timeout: header_timeout,
            })?
            .map_err(|source| TransportError::Request {
                url: proxy_url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: proxy_url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(body);
        tokio::pin!(reader);
        let mut buf = vec![0u8; settings.chunk_bytes];
        let mut bytes_read = 0u64;

        loop {
            let n = tokio::time::timeout(settings.read_timeout, reader.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout {
                    url: proxy_url.to_string(),
                    timeout: settings.read_timeout,
                })?
                .map_err(|source| TransportError::Read {
                    url: proxy_url.to_string(),
                    source,
                })?;

            if n == 0 {
                return Ok(ReadEnd::Exhausted(bytes_read));
            }
            bytes_read += n as u64;

            if self.is_cancelled() {
                return Ok(ReadEnd::Cancelled(bytes_read));
            }
            if bytes_read >= target {
                return Ok(ReadEnd::Reached(bytes_read));
            }
        }
    }

    async fn discard_artifacts(&self, proxy: &dyn CacheProxy) {
        for path in [
            proxy.cache_file_path(self.url()),
            proxy.temp_cache_file_path(self.url()),
        ] {
            if let Err(e) = proxy.delete_cache_file(&path).await {
                warn!("failed to discard {}: {:#}", path.display(), e);
            }
        }
    }
}
