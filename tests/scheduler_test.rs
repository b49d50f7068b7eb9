// Integration tests for the PreloadScheduler against a fake caching proxy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};

use ma_preload_engine::{
    Admission, CacheProxy, FailureKind, PreloadConfig, PreloadEvent, PreloadOutcome,
    PreloadScheduler,
};

const TOTAL: u64 = 1_000_000;

/// Fake caching proxy: serves `/media/{name}` with behaviour chosen by name.
struct FakeProxy {
    content: Vec<u8>,
    gate: Semaphore,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeProxy {
    fn requests_for(&self, name: &str) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, range)| range.clone())
            .collect()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

/// Parse "bytes=0-END" into an inclusive end clamped to the content.
fn range_end(headers: &HeaderMap, total: u64) -> u64 {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes=0-"))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(total - 1)
        .min(total - 1)
}

async fn media_handler(
    State(fake): State<Arc<FakeProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    fake.requests.lock().push((name.clone(), range));

    let end = range_end(&headers, fake.content.len() as u64);
    match name.as_str() {
        "empty" => (StatusCode::PARTIAL_CONTENT, Vec::<u8>::new()).into_response(),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "upstream failed").into_response(),
        "short" => (StatusCode::PARTIAL_CONTENT, fake.content[..1000].to_vec()).into_response(),
        "slow" => {
            // 8 KB every 50 ms, far slower than any test waits for.
            let stream = futures_util::stream::unfold(0u64, |sent| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let chunk = Bytes::from(vec![7u8; 8 * 1024]);
                Some((Ok::<_, std::io::Error>(chunk), sent + 1))
            });
            (StatusCode::PARTIAL_CONTENT, Body::from_stream(stream)).into_response()
        }
        "stall" => {
            // One chunk, then the connection goes quiet.
            let first = futures_util::stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from(vec![7u8; 8 * 1024]))
            });
            let stream = first.chain(futures_util::stream::pending());
            (StatusCode::PARTIAL_CONTENT, Body::from_stream(stream)).into_response()
        }
        other if other.starts_with("fast") => {
            // Small chunks with a yield in between, so cancels land mid-stream.
            let stream = futures_util::stream::unfold((), |_| async {
                tokio::task::yield_now().await;
                Some((Ok::<_, std::io::Error>(Bytes::from(vec![3u8; 1024])), ()))
            });
            (StatusCode::PARTIAL_CONTENT, Body::from_stream(stream)).into_response()
        }
        other => {
            if other.starts_with("gated") {
                if let Ok(permit) = fake.gate.acquire().await {
                    permit.forget();
                }
            }
            let slice = fake.content[..=end as usize].to_vec();
            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes 0-{}/{}", end, fake.content.len()),
                )],
                slice,
            )
                .into_response()
        }
    }
}

async fn start_fake_proxy() -> (String, Arc<FakeProxy>) {
    let fake = Arc::new(FakeProxy {
        content: (0..TOTAL).map(|i| (i % 256) as u8).collect(),
        gate: Semaphore::new(0),
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/media/{name}", get(media_handler))
        .with_state(fake.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{}", addr), fake)
}

/// Cache collaborator stub: one file per source name under a temp dir.
struct StubProxy {
    base: String,
    dir: PathBuf,
    fail_length: bool,
}

fn name_of(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[async_trait]
impl CacheProxy for StubProxy {
    fn proxy_url(&self, source_url: &str) -> String {
        format!("{}/media/{}", self.base, name_of(source_url))
    }

    fn cache_file_path(&self, source_url: &str) -> PathBuf {
        self.dir.join(name_of(source_url))
    }

    fn temp_cache_file_path(&self, source_url: &str) -> PathBuf {
        self.dir.join(format!("{}.download", name_of(source_url)))
    }

    async fn is_fully_cached(&self, source_url: &str) -> Result<bool> {
        Ok(self.cache_file_path(source_url).exists())
    }

    async fn source_content_length(&self, _source_url: &str) -> Result<u64> {
        if self.fail_length {
            return Err(anyhow!("length unavailable"));
        }
        Ok(TOTAL)
    }
}

struct Harness {
    scheduler: PreloadScheduler,
    fake: Arc<FakeProxy>,
    base: String,
    dir: TempDir,
}

impl Harness {
    fn write_file(&self, name: &str, len: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, vec![1u8; len]).unwrap();
        path
    }
}

async fn harness_with(fail_length: bool) -> Harness {
    harness_with_config(fail_length, PreloadConfig::default()).await
}

async fn harness_with_config(fail_length: bool, config: PreloadConfig) -> Harness {
    let (base, fake) = start_fake_proxy().await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(StubProxy {
        base: base.clone(),
        dir: dir.path().to_path_buf(),
        fail_length,
    });
    let scheduler = PreloadScheduler::new(proxy, config).unwrap();
    Harness {
        scheduler,
        fake,
        base,
        dir,
    }
}

async fn harness() -> Harness {
    harness_with(false).await
}

fn url(name: &str) -> String {
    format!("https://cdn.test/videos/{}", name)
}

async fn next_event(rx: &mut broadcast::Receiver<PreloadEvent>) -> PreloadEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for preload event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
async fn collect_until(
    rx: &mut broadcast::Receiver<PreloadEvent>,
    done: impl Fn(&PreloadEvent) -> bool,
) -> Vec<PreloadEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

async fn outcome_of(admission: Admission) -> PreloadOutcome {
    let handle = admission.into_handle().expect("task should have been queued");
    tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .expect("timed out waiting for outcome")
}

#[tokio::test]
async fn test_preload_reads_target_percent() {
    let h = harness().await;

    let admission = h.scheduler.add_preload_task(&url("clip.mp4"), 20).await;
    let outcome = outcome_of(admission).await;

    match outcome {
        PreloadOutcome::Succeeded { bytes_read } => assert!(bytes_read >= 200_000),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.fake.requests_for("clip.mp4"), vec!["bytes=0-200000"]);
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_empty_read_fails_and_discards_artifacts() {
    let h = harness().await;
    // Partial artifact well below the target.
    let temp = h.write_file("empty.download", 10);

    let admission = h.scheduler.add_preload_task(&url("empty"), 20).await;
    let outcome = outcome_of(admission).await;

    assert_eq!(outcome.failure_code(), Some(FailureKind::EmptyRead.code()));
    assert!(!temp.exists());
}

#[tokio::test]
async fn test_http_error_is_transport_failure() {
    let h = harness().await;

    let outcome = outcome_of(h.scheduler.add_preload_task(&url("broken"), 20).await).await;

    assert!(matches!(
        outcome,
        PreloadOutcome::Failed {
            kind: FailureKind::Transport,
            ..
        }
    ));
    assert_eq!(outcome.failure_code(), Some(-2));
}

#[tokio::test]
async fn test_short_stream_is_incomplete() {
    let h = harness().await;

    let outcome = outcome_of(h.scheduler.add_preload_task(&url("short"), 20).await).await;

    assert_eq!(outcome.failure_code(), Some(FailureKind::Incomplete.code()));
}

#[tokio::test]
async fn test_stalled_read_times_out_as_transport_failure() {
    let config = PreloadConfig {
        read_timeout_ms: 200,
        ..PreloadConfig::default()
    };
    let h = harness_with_config(false, config).await;

    let started = std::time::Instant::now();
    let outcome = outcome_of(h.scheduler.add_preload_task(&url("stall"), 20).await).await;

    match outcome {
        PreloadOutcome::Failed { kind, detail } => {
            assert_eq!(kind, FailureKind::Transport);
            assert!(detail.contains("200ms"), "detail: {}", detail);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(h.scheduler.running_urls().is_empty());
}

#[tokio::test]
async fn test_length_query_failure_is_transport_failure() {
    let h = harness_with(true).await;

    let outcome = outcome_of(h.scheduler.add_preload_task(&url("clip.mp4"), 20).await).await;

    assert_eq!(outcome.failure_code(), Some(FailureKind::Transport.code()));
    assert_eq!(h.fake.request_count(), 0);
}

#[tokio::test]
async fn test_fully_cached_is_not_queued() {
    let h = harness().await;
    h.write_file("done.mp4", 2048);

    let admission = h.scheduler.add_preload_task(&url("done.mp4"), 20).await;

    assert!(matches!(admission, Admission::AlreadyCached));
    assert_eq!(h.scheduler.len(), 0);
    assert_eq!(h.fake.request_count(), 0);
}

#[tokio::test]
async fn test_undersized_cache_file_is_discarded_and_requeued() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);
    let corrupt = h.write_file("corrupt.mp4", 100);

    let admission = h.scheduler.add_preload_task(&url("corrupt.mp4"), 20).await;

    assert!(admission.is_queued());
    assert!(!corrupt.exists());
    assert_eq!(h.scheduler.queued_urls(), vec![url("corrupt.mp4")]);
}

#[tokio::test]
async fn test_partial_cache_covering_percent_is_not_queued() {
    let h = harness().await;
    h.write_file("warm.mp4.download", 200_000);

    let admission = h.scheduler.add_preload_task(&url("warm.mp4"), 20).await;
    assert!(matches!(admission, Admission::AlreadyPreloaded));

    // A larger percent is not covered yet.
    h.scheduler.set_preload_enabled(false);
    let admission = h.scheduler.add_preload_task(&url("warm.mp4"), 50).await;
    assert!(admission.is_queued());
}

#[tokio::test]
async fn test_duplicate_url_is_not_queued_twice() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);

    let first = h.scheduler.add_preload_task(&url("a.mp4"), 20).await;
    let second = h.scheduler.add_preload_task(&url("a.mp4"), 40).await;

    assert!(first.is_queued());
    assert!(matches!(second, Admission::AlreadyQueued));
    assert_eq!(h.scheduler.len(), 1);
}

#[tokio::test]
async fn test_tasks_run_one_at_a_time_in_order() {
    let h = harness().await;
    let mut events = h.scheduler.subscribe();

    let a = h.scheduler.add_preload_task(&url("gated-a.mp4"), 20).await;
    let b = h.scheduler.add_preload_task(&url("b.mp4"), 20).await;
    assert!(a.is_queued() && b.is_queued());

    // A starts; B waits behind it.
    collect_until(&mut events, |e| {
        matches!(e, PreloadEvent::Started { url: u } if u == &url("gated-a.mp4"))
    })
    .await;
    assert_eq!(h.scheduler.running_urls(), vec![url("gated-a.mp4")]);
    assert_eq!(h.scheduler.queued_urls(), vec![url("b.mp4")]);
    assert!(h.fake.requests_for("b.mp4").is_empty());

    h.fake.gate.add_permits(1);

    let seen = collect_until(&mut events, |e| {
        matches!(e, PreloadEvent::Finished { url: u, .. } if u == &url("b.mp4"))
    })
    .await;
    let finished_a = seen
        .iter()
        .position(|e| matches!(e, PreloadEvent::Finished { url: u, .. } if u == &url("gated-a.mp4")))
        .expect("A finished");
    let started_b = seen
        .iter()
        .position(|e| matches!(e, PreloadEvent::Started { url: u } if u == &url("b.mp4")))
        .expect("B started");
    assert!(finished_a < started_b);

    assert!(outcome_of(a).await.is_success());
    assert!(outcome_of(b).await.is_success());
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_remove_all_cancels_every_task_once() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);
    let mut events = h.scheduler.subscribe();

    let names = ["one.mp4", "two.mp4", "three.mp4"];
    let mut handles = Vec::new();
    for name in names {
        let admission = h.scheduler.add_preload_task(&url(name), 20).await;
        handles.push(admission.into_handle().unwrap());
    }

    h.scheduler.remove_all_preload_tasks();
    assert!(h.scheduler.is_empty());

    for handle in handles {
        assert_eq!(handle.outcome().await, PreloadOutcome::Cancelled);
    }

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    for name in names {
        let for_url: Vec<&PreloadEvent> = seen.iter().filter(|e| e.url() == url(name)).collect();
        let finished = for_url
            .iter()
            .filter(|e| matches!(e, PreloadEvent::Finished { .. }))
            .count();
        let cancels = for_url
            .iter()
            .filter(|e| matches!(e, PreloadEvent::CancelRequested { .. }))
            .count();
        assert_eq!(finished, 1);
        assert_eq!(cancels, 1);
        assert!(matches!(
            for_url.last(),
            Some(PreloadEvent::Finished {
                outcome: PreloadOutcome::Cancelled,
                ..
            })
        ));
    }

    // Cancelled before starting: nothing reached the network.
    h.scheduler.set_preload_enabled(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fake.request_count(), 0);
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_at_chunk_boundary() {
    let h = harness().await;
    let mut events = h.scheduler.subscribe();

    let admission = h.scheduler.add_preload_task(&url("slow"), 20).await;
    collect_until(&mut events, |e| matches!(e, PreloadEvent::Started { .. })).await;
    // Let a few chunks arrive.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.scheduler.remove_preload_task(&url("slow")));
    assert!(h.scheduler.is_empty());

    assert_eq!(outcome_of(admission).await, PreloadOutcome::Cancelled);
    assert!(h.scheduler.running_urls().is_empty());
}

#[tokio::test]
async fn test_readding_while_cancelled_task_winds_down_supersedes() {
    let h = harness().await;
    let mut events = h.scheduler.subscribe();

    let first = h.scheduler.add_preload_task(&url("slow"), 20).await;
    collect_until(&mut events, |e| matches!(e, PreloadEvent::Started { .. })).await;

    // Pause keeps nothing in the queue; re-adding creates a fresh task.
    assert!(h.scheduler.pause_preload(&url("slow")));
    let second = h.scheduler.add_preload_task(&url("slow"), 20).await;
    assert!(second.is_queued());
    assert!(!h.scheduler.is_paused(&url("slow")));

    assert_eq!(outcome_of(first).await, PreloadOutcome::Cancelled);
    // The replacement survives the first task's completion.
    assert_eq!(h.scheduler.len(), 1);
    h.scheduler.remove_all_preload_tasks();
    assert_eq!(outcome_of(second).await, PreloadOutcome::Cancelled);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);

    let admission = h.scheduler.add_preload_task(&url("p.mp4"), 30).await;
    assert!(h.scheduler.pause_preload(&url("p.mp4")));
    assert!(h.scheduler.is_paused(&url("p.mp4")));
    assert!(h.scheduler.is_empty());
    assert_eq!(outcome_of(admission).await, PreloadOutcome::Cancelled);

    let resumed = h.scheduler.resume_preload(&url("p.mp4")).await;
    assert!(matches!(resumed, Some(Admission::Queued(_))));
    assert!(!h.scheduler.is_paused(&url("p.mp4")));
    assert_eq!(h.scheduler.queued_urls(), vec![url("p.mp4")]);

    assert!(h.scheduler.resume_preload(&url("unknown.mp4")).await.is_none());
    assert!(!h.scheduler.pause_preload(&url("unknown.mp4")));
}

#[tokio::test]
async fn test_resumed_task_completes() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);

    h.scheduler.add_preload_task(&url("r.mp4"), 20).await;
    h.scheduler.pause_preload(&url("r.mp4"));
    let resumed = h.scheduler.resume_preload(&url("r.mp4")).await.unwrap();
    h.scheduler.set_preload_enabled(true);

    assert!(outcome_of(resumed).await.is_success());
}

#[tokio::test]
async fn test_play_url_prefers_cache() {
    let h = harness().await;
    h.write_file("cached.mp4", 4096);

    assert_eq!(
        h.scheduler.play_url(&url("cached.mp4")).await,
        format!("{}/media/cached.mp4", h.base)
    );
    assert_eq!(h.scheduler.play_url(&url("cold.mp4")).await, url("cold.mp4"));
}

#[tokio::test]
async fn test_play_url_cancels_pending_preload() {
    let h = harness().await;
    h.scheduler.set_preload_enabled(false);

    let admission = h.scheduler.add_preload_task(&url("next.mp4"), 20).await;
    let play = h.scheduler.play_url(&url("next.mp4")).await;

    assert_eq!(play, url("next.mp4"));
    assert!(h.scheduler.is_empty());
    assert_eq!(outcome_of(admission).await, PreloadOutcome::Cancelled);
}

#[tokio::test]
async fn test_remove_unknown_url_is_noop() {
    let h = harness().await;
    assert!(!h.scheduler.remove_preload_task(&url("nothing.mp4")));
    h.scheduler.remove_all_preload_tasks();
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn test_finished_is_last_event_when_cancelled_mid_stream() {
    let h = harness().await;

    for i in 0..100u64 {
        let mut events = h.scheduler.subscribe();
        let target = url(&format!("fast-{}", i));

        let admission = h.scheduler.add_preload_task(&target, 20).await;
        let handle = admission.into_handle().expect("task should have been queued");
        tokio::time::sleep(Duration::from_micros(200 * (i % 10))).await;
        h.scheduler.remove_preload_task(&target);

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
            .await
            .expect("timed out waiting for outcome");

        // The handle resolves only after Finished was broadcast.
        let mut for_url = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.url() == target {
                for_url.push(event);
            }
        }
        assert!(
            matches!(for_url.last(), Some(PreloadEvent::Finished { .. })),
            "iteration {}: {:?}",
            i,
            for_url
        );
        // Nothing for this URL may follow Finished.
        tokio::time::sleep(Duration::from_millis(5)).await;
        while let Ok(event) = events.try_recv() {
            if event.url() == target {
                for_url.push(event);
            }
        }

        let finished = for_url
            .iter()
            .filter(|e| matches!(e, PreloadEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1, "iteration {}: {:?}", i, for_url);
        match for_url.last() {
            Some(PreloadEvent::Finished { outcome: last, .. }) => assert_eq!(last, &outcome),
            other => panic!("iteration {}: last event {:?} in {:?}", i, other, for_url),
        }
    }
    assert!(h.scheduler.is_empty());
}
