// Preload scheduler: FIFO queue of per-URL tasks with a soft cap on running preloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use super::event::{PreloadEvent, PreloadOutcome};
use super::task::{target_length, PreloadHandle, PreloadRequest, PreloadTask, TaskSettings, TaskState};
use crate::config::PreloadConfig;
use crate::proxy::traits::{file_len, CacheProxy};

/// Result of asking the scheduler to preload a URL.
#[derive(Debug)]
pub enum Admission {
    /// A completed cache file of valid size exists.
    AlreadyCached,
    /// The partial cache file already covers the requested percent.
    AlreadyPreloaded,
    /// A live task for this URL is queued or running.
    AlreadyQueued,
    Queued(PreloadHandle),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }

    pub fn into_handle(self) -> Option<PreloadHandle> {
        match self {
            Admission::Queued(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    FullyCached,
    Preloaded,
    Missing,
}

struct QueueState {
    /// Insertion-ordered; at most one entry per URL.
    tasks: IndexMap<String, Arc<PreloadTask>>,
    /// Tasks holding a worker slot, keyed by task id. May outlive their queue entry.
    running: IndexMap<u64, Arc<PreloadTask>>,
    /// Requests stopped by `pause_preload`, with their percent.
    paused: IndexMap<String, u8>,
    enabled: bool,
}

struct Shared {
    proxy: Arc<dyn CacheProxy>,
    client: Client,
    settings: TaskSettings,
    default_percent: u8,
    min_valid_cache_bytes: u64,
    max_active: usize,
    runtime: Handle,
    workers: Arc<Semaphore>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<PreloadEvent>,
    next_id: AtomicU64,
}

pub struct PreloadScheduler {
    shared: Arc<Shared>,
}

impl PreloadScheduler {
    /// Must be called from within a tokio runtime; workers are spawned onto it.
    pub fn new(proxy: Arc<dyn CacheProxy>, config: PreloadConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().context("preload scheduler requires a tokio runtime")?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .context("failed to build preload http client")?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            "preload scheduler ready workers={} max_active={} default_percent={}",
            config.worker_threads,
            config.max_active(),
            config.default_percent
        );

        Ok(Self {
            shared: Arc::new(Shared {
                proxy,
                client,
                settings: TaskSettings::from(&config),
                default_percent: config.default_percent.min(100),
                min_valid_cache_bytes: config.min_valid_cache_bytes,
                max_active: config.max_active(),
                runtime,
                workers: Arc::new(Semaphore::new(config.worker_threads.max(1))),
                state: Mutex::new(QueueState {
                    tasks: IndexMap::new(),
                    running: IndexMap::new(),
                    paused: IndexMap::new(),
                    enabled: true,
                }),
                events,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Queue a preload of the leading `percent` of `url` unless the cache already covers it.
    pub async fn add_preload_task(&self, url: &str, percent: u32) -> Admission {
        let request = PreloadRequest::new(url, percent);
        match self
            .shared
            .cache_status(&request.source_url, request.target_percent)
            .await
        {
            CacheStatus::FullyCached => {
                debug!("preload not needed, fully cached url={}", url);
                Admission::AlreadyCached
            }
            CacheStatus::Preloaded => {
                debug!("preload not needed, already preloaded url={}", url);
                Admission::AlreadyPreloaded
            }
            CacheStatus::Missing => self.shared.enqueue(request),
        }
    }

    /// Stop the preload for `url` and remember it so `resume_preload` can restart it.
    pub fn pause_preload(&self, url: &str) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            let Some(task) = state.tasks.shift_remove(url) else {
                return false;
            };
            self.shared.request_cancel(&task);
            state.paused.insert(url.to_string(), task.percent());
            task
        };
        debug!("pause preload url={}", url);
        self.shared.finish_if_unstarted(&task);
        true
    }

    /// Re-admit a paused URL. Bytes the proxy already cached are kept, so the
    /// reissued range is mostly served from disk. `None` if `url` wasn't paused.
    pub async fn resume_preload(&self, url: &str) -> Option<Admission> {
        let percent = self.shared.state.lock().paused.shift_remove(url)?;
        debug!("resume preload url={} percent={}", url, percent);
        Some(self.add_preload_task(url, percent as u32).await)
    }

    /// Cancel and drop the task for `url`.
    pub fn remove_preload_task(&self, url: &str) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            state.paused.shift_remove(url);
            let task = state.tasks.shift_remove(url);
            if let Some(task) = &task {
                self.shared.request_cancel(task);
            }
            task
        };
        match task {
            Some(task) => {
                self.shared.finish_if_unstarted(&task);
                true
            }
            None => false,
        }
    }

    /// Cancel and drop every task, and forget paused requests.
    pub fn remove_all_preload_tasks(&self) {
        let tasks: Vec<Arc<PreloadTask>> = {
            let mut state = self.shared.state.lock();
            state.paused.clear();
            let tasks: Vec<Arc<PreloadTask>> =
                state.tasks.drain(..).map(|(_, task)| task).collect();
            for task in &tasks {
                self.shared.request_cancel(task);
            }
            tasks
        };
        if !tasks.is_empty() {
            info!("remove all preload tasks count={}", tasks.len());
        }
        for task in &tasks {
            self.shared.finish_if_unstarted(task);
        }
    }

    /// URL the player should open. Playback supersedes any preload for the same URL.
    pub async fn play_url(&self, url: &str) -> String {
        let task = {
            let mut state = self.shared.state.lock();
            let task = state.tasks.shift_remove(url);
            if let Some(task) = &task {
                self.shared.request_cancel(task);
            }
            task
        };
        let percent = match task {
            Some(task) => {
                self.shared.finish_if_unstarted(&task);
                task.percent()
            }
            None => self.shared.default_percent,
        };

        match self.shared.cache_status(url, percent).await {
            CacheStatus::FullyCached | CacheStatus::Preloaded => self.shared.proxy.proxy_url(url),
            CacheStatus::Missing => url.to_string(),
        }
    }

    /// While disabled, new tasks are queued but not started.
    pub fn set_preload_enabled(&self, enabled: bool) {
        let ready = {
            let mut state = self.shared.state.lock();
            state.enabled = enabled;
            self.shared.take_ready(&mut state)
        };
        debug!("preload enabled={}", enabled);
        self.shared.spawn_all(ready);
    }

    pub fn is_preload_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadEvent> {
        self.shared.events.subscribe()
    }

    /// URLs waiting for a worker, in dispatch order.
    pub fn queued_urls(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .tasks
            .values()
            .filter(|task| task.state() == TaskState::Queued)
            .map(|task| task.url().to_string())
            .collect()
    }

    /// URLs currently holding a worker slot, including cancelled ones winding down.
    pub fn running_urls(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .running
            .values()
            .map(|task| task.url().to_string())
            .collect()
    }

    pub fn is_paused(&self, url: &str) -> bool {
        self.shared.state.lock().paused.contains_key(url)
    }

    /// Number of queue entries (queued or running).
    pub fn len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PreloadScheduler {
    fn drop(&mut self) {
        debug!("PreloadScheduler dropped, cancelling preloads");
        self.remove_all_preload_tasks();
    }
}

impl Shared {
    fn emit(&self, event: PreloadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Whether the cache already covers `percent` of `url`. Collaborator failures count as missing.
    async fn cache_status(&self, url: &str, percent: u8) -> CacheStatus {
        let cache_path = self.proxy.cache_file_path(url);
        match file_len(&cache_path).await {
            Ok(Some(len)) if len >= self.min_valid_cache_bytes => return CacheStatus::FullyCached,
            Ok(Some(len)) => {
                warn!(
                    "discarding undersized cache file url={} bytes={} path={}",
                    url,
                    len,
                    cache_path.display()
                );
                if let Err(e) = self.proxy.delete_cache_file(&cache_path).await {
                    warn!("failed to discard corrupt cache file: {:#}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("cache file check failed url={}: {:#}", url, e),
        }

        let temp_path = self.proxy.temp_cache_file_path(url);
        let temp_len = match file_len(&temp_path).await {
            Ok(Some(len)) => len,
            Ok(None) => return CacheStatus::Missing,
            Err(e) => {
                warn!("temp cache file check failed url={}: {:#}", url, e);
                return CacheStatus::Missing;
            }
        };

        match self.proxy.source_content_length(url).await {
            Ok(total) if temp_len >= target_length(total, percent) => CacheStatus::Preloaded,
            Ok(_) => CacheStatus::Missing,
            Err(e) => {
                warn!("source length unavailable url={}: {:#}", url, e);
                CacheStatus::Missing
            }
        }
    }

    fn enqueue(self: &Arc<Self>, request: PreloadRequest) -> Admission {
        let url = request.source_url.clone();
        let percent = request.target_percent;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (task, handle) = PreloadTask::new(id, request);

        let ready = {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&url) {
                return Admission::AlreadyQueued;
            }
            // Cancelled tasks leave `tasks` at once; one still winding down in
            // `running` is superseded by the new entry.
            state.paused.shift_remove(&url);
            state.tasks.insert(url.clone(), Arc::new(task));
            self.take_ready(&mut state)
        };

        info!("preload queued task={} url={} percent={}", id, url, percent);
        self.emit(PreloadEvent::Queued { url });
        self.spawn_all(ready);
        Admission::Queued(handle)
    }

    /// Claim queued tasks in FIFO order while worker slots are free.
    /// Only live entries (present, queued, not cancelled) are claimed.
    fn take_ready(&self, state: &mut QueueState) -> Vec<Arc<PreloadTask>> {
        let mut ready = Vec::new();
        if !state.enabled {
            return ready;
        }
        while state.running.len() < self.max_active {
            let next = state
                .tasks
                .values()
                .find(|task| task.state() == TaskState::Queued && !task.is_cancelled())
                .cloned();
            let Some(task) = next else {
                break;
            };
            if !task.try_submit() {
                break;
            }
            state.running.insert(task.id(), Arc::clone(&task));
            ready.push(task);
        }
        ready
    }

    fn spawn_all(self: &Arc<Self>, ready: Vec<Arc<PreloadTask>>) {
        for task in ready {
            self.spawn(task);
        }
    }

    fn spawn(self: &Arc<Self>, task: Arc<PreloadTask>) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = match Arc::clone(&shared.workers).acquire_owned().await {
                Ok(_permit) => {
                    shared.emit(PreloadEvent::Started {
                        url: task.url().to_string(),
                    });
                    task.run(shared.proxy.as_ref(), &shared.client, &shared.settings)
                        .await
                }
                Err(_) => PreloadOutcome::Cancelled,
            };
            shared.on_task_done(&task, outcome);
        });
    }

    /// Dequeue a finished task and claim the next one under the same lock.
    fn on_task_done(self: &Arc<Self>, task: &Arc<PreloadTask>, outcome: PreloadOutcome) {
        let ready = {
            let mut state = self.state.lock();
            state.running.shift_remove(&task.id());
            let still_queued = state
                .tasks
                .get(task.url())
                .is_some_and(|entry| Arc::ptr_eq(entry, task));
            if still_queued {
                state.tasks.shift_remove(task.url());
            }
            self.take_ready(&mut state)
        };
        self.finish(task, outcome);
        self.spawn_all(ready);
    }

    /// `Finished` is broadcast before the handle resolves.
    fn finish(&self, task: &PreloadTask, outcome: PreloadOutcome) {
        if !task.mark_finished(&outcome) {
            return;
        }
        match &outcome {
            PreloadOutcome::Failed { kind, detail } => info!(
                "preload finished task={} url={} failed: {} {}",
                task.id(),
                task.url(),
                kind,
                detail
            ),
            other => debug!(
                "preload finished task={} url={} outcome={:?}",
                task.id(),
                task.url(),
                other
            ),
        }
        self.emit(PreloadEvent::Finished {
            url: task.url().to_string(),
            outcome: outcome.clone(),
        });
        task.resolve(outcome);
    }

    /// Cancel a task just detached from the queue. Must run under the queue lock,
    /// which a worker takes before reporting `Finished`.
    fn request_cancel(&self, task: &PreloadTask) {
        task.cancel();
        self.emit(PreloadEvent::CancelRequested {
            url: task.url().to_string(),
        });
    }

    /// Tasks that never reached a worker finish here; running ones finish at their
    /// next chunk boundary.
    fn finish_if_unstarted(&self, task: &PreloadTask) {
        if task.state() == TaskState::Queued {
            self.finish(task, PreloadOutcome::Cancelled);
        }
    }
}
