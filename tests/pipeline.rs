//! End-to-end scenarios from the retrieval pipeline's design notes: a single
//! successful load, request deduplication (whole and partial-cancel), stable
//! processor ordering, prefetch not starving foreground work, and cancelling
//! a task before it's ever resumed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use pipeline_core::{
    CachePolicy, DataCaching, DataDecoding, DataLoading, Image, LoadingError, Manager, MemoryCache,
    PipelineCollaborators, Processor, ProcessorList, ProgressSink, Request, ResponseMetadata,
    StageExecutors, TaskError, TaskState,
};
use pipeline_core::{Deduplicator, Loader, PrefetchConfig, Prefetcher};

/// A loading collaborator whose calls can be held open until the test
/// chooses to release them, letting scenarios line up "both requests queued"
/// before either completes.
struct GatedLoader {
    gate: Arc<Notify>,
    gated: bool,
    calls: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
}

#[async_trait]
impl DataLoading for GatedLoader {
    async fn load(
        &self,
        request: &Request,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(Vec<u8>, ResponseMetadata), LoadingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.concurrent.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = cancel.cancelled() => {
                    self.concurrent.fetch_sub(1, Ordering::SeqCst);
                    return Err(LoadingError::from_message("cancelled"));
                }
            }
        }
        progress.tick(50, 100);
        progress.tick(100, 100);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok((request.url.clone().into_bytes(), ResponseMetadata::default()))
    }
}

/// Decodes the URL bytes back into a 1x1 image whose pixel buffer is just
/// the URL, so a per-request "image" is trivially distinguishable in tests.
struct EchoDecoder;

#[async_trait]
impl DataDecoding for EchoDecoder {
    async fn decode(&self, bytes: &[u8], _response: &ResponseMetadata) -> Option<Image> {
        Some(Image::new(1, 1, bytes.len() as u32, bytes.to_vec()))
    }
}

/// A processor that appends its label to the pixel buffer, so the final
/// buffer records the order processors ran in.
struct AppendLabel(&'static str);

impl Processor for AppendLabel {
    fn name(&self) -> &str {
        self.0
    }

    fn apply(&self, image: &Image) -> Option<Image> {
        let mut pixels = image.pixels().to_vec();
        pixels.extend_from_slice(self.0.as_bytes());
        Some(Image::new(image.width(), image.height(), pixels.len() as u32, pixels))
    }

    fn equals(&self, other: &dyn Processor) -> bool {
        other.name() == self.0
    }
}

fn build(
    data_loader: Arc<dyn DataLoading>,
    disk_cache: Option<Arc<dyn DataCaching>>,
) -> (Arc<Manager>, Arc<MemoryCache>) {
    let loader = Loader::new(
        PipelineCollaborators { data_loader, decoder: Arc::new(EchoDecoder), disk_cache },
        Arc::new(StageExecutors::default()),
    );
    let dedup = Arc::new(Deduplicator::new(Arc::new(loader)));
    let cache = Arc::new(MemoryCache::new(usize::MAX / 2));
    (Arc::new(Manager::new(dedup, cache.clone())), cache)
}

#[tokio::test]
async fn single_success_reports_progress_and_populates_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: Arc::new(Notify::new()),
        gated: false,
        calls,
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, None);

    let ticks = Arc::new(Mutex::new(Vec::new()));
    let ticks_for_cb = ticks.clone();
    let progress: pipeline_core::ProgressCallback = Arc::new(move |completed, total| {
        ticks_for_cb.lock().unwrap().push((completed, total));
    });

    let (tx, rx) = oneshot::channel();
    let request = Request::new("http://t/1");
    let task = manager.make_task(
        request.clone(),
        Some(progress),
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    );
    task.resume();

    let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(*ticks.lock().unwrap(), vec![(50, 100), (100, 100)]);

    let cached = manager.image_for(&request).expect("image should be cached");
    assert_eq!(cached.pixels(), b"http://t/1");
}

#[tokio::test]
async fn concurrent_identical_requests_collapse_into_one_load() {
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: gate.clone(),
        gated: true,
        calls: calls.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, None);

    let request = Request::new("http://t/1");
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let t1 = manager.make_task(request.clone(), None, Some(Box::new(move |r| { let _ = tx1.send(r); })));
    let t2 = manager.make_task(request, None, Some(Box::new(move |r| { let _ = tx2.send(r); })));
    t1.resume();
    t2.resume();

    // give the manager/dedup actors a chance to both subscribe before the
    // gate is released.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    gate.notify_waiters();
    let r1 = tokio::time::timeout(Duration::from_secs(1), rx1).await.unwrap().unwrap();
    let r2 = tokio::time::timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();
    assert!(r1.is_ok());
    assert!(r2.is_ok());
}

#[tokio::test]
async fn cancelling_one_of_two_dedup_subscribers_leaves_the_other_intact() {
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: gate.clone(),
        gated: true,
        calls: calls.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, None);

    let request = Request::new("http://t/1");
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let t1 = manager.make_task(request.clone(), None, Some(Box::new(move |r| { let _ = tx1.send(r); })));
    let t2 = manager.make_task(request, None, Some(Box::new(move |r| { let _ = tx2.send(r); })));
    t1.resume();
    t2.resume();
    tokio::time::sleep(Duration::from_millis(30)).await;

    t1.cancel();
    tokio::time::sleep(Duration::from_millis(30)).await;

    gate.notify_waiters();
    let r1 = tokio::time::timeout(Duration::from_secs(1), rx1).await.unwrap().unwrap();
    let r2 = tokio::time::timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();

    assert!(matches!(r1, Err(TaskError::Cancelled)));
    assert!(r2.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn processors_run_in_order_and_survive_a_cache_hit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: Arc::new(Notify::new()),
        gated: false,
        calls: calls.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, None);

    let processors = ProcessorList::new(vec![Arc::new(AppendLabel("a")), Arc::new(AppendLabel("b"))]);
    let request = Request::new("http://t/1").with_processors(processors);

    let (tx, rx) = oneshot::channel();
    let task = manager.make_task(request.clone(), None, Some(Box::new(move |r| { let _ = tx.send(r); })));
    task.resume();
    let image = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap().unwrap();
    assert_eq!(image.pixels(), b"http://t/1ab");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // a second resume against the same caching-equivalent request should hit
    // the memory cache and never touch the loader again.
    let (tx2, rx2) = oneshot::channel();
    let task2 = manager.make_task(request, None, Some(Box::new(move |r| { let _ = tx2.send(r); })));
    task2.resume();
    let image2 = tokio::time::timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap().unwrap();
    assert_eq!(image2.pixels(), b"http://t/1ab");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_before_resume_never_touches_the_loader() {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: Arc::new(Notify::new()),
        gated: false,
        calls: calls.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, None);

    let (tx, rx) = oneshot::channel();
    let task = manager.make_task(
        Request::new("http://t/1"),
        None,
        Some(Box::new(move |r| {
            let _ = tx.send(r);
        })),
    );
    task.cancel();
    task.resume(); // no-op: task is already terminal

    let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert!(matches!(result, Err(TaskError::Cancelled)));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn prefetching_does_not_starve_foreground_tasks() {
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader { gate: gate.clone(), gated: true, calls: calls.clone(), concurrent: concurrent.clone() });
    let (manager, _cache) = build(loader, None);

    let prefetcher = Prefetcher::new(
        manager.clone(),
        PrefetchConfig { max_concurrent_preheat_tasks: 2, coalesce_delay: Duration::from_millis(200) },
    );

    let preheat_requests: Vec<Request> = (0..10).map(|i| Request::new(format!("http://preheat/{i}"))).collect();
    prefetcher.start_preheating(preheat_requests);

    // give preheating a chance to run its coalesced resume pass before any
    // foreground work shows up.
    tokio::time::advance(Duration::from_millis(250)).await;
    tokio::task::yield_now().await;
    assert!(calls.load(Ordering::SeqCst) <= 2, "at most max_concurrent_preheat_tasks should have started");

    // five foreground tasks, created and resumed directly against the
    // manager, bypassing the prefetcher's own budget entirely.
    let mut foreground = Vec::new();
    for i in 0..5 {
        let (tx, rx) = oneshot::channel();
        let task = manager.make_task(
            Request::new(format!("http://foreground/{i}")),
            None,
            Some(Box::new(move |r| {
                let _ = tx.send(r);
            })),
        );
        task.resume();
        foreground.push(rx);
    }

    tokio::task::yield_now().await;
    // running_count now includes 5 foreground + up to 2 preheat tasks, well
    // over the preheat budget, so no further preheat slot should open up.
    let calls_before_release = calls.load(Ordering::SeqCst);

    gate.notify_waiters();
    for rx in foreground {
        let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    assert!(calls_before_release <= 2 + 5);
}

struct RecordingDiskCache {
    store: Mutex<HashMap<String, (Vec<u8>, ResponseMetadata)>>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl DataCaching for RecordingDiskCache {
    async fn get(&self, request: &Request) -> Option<(Vec<u8>, ResponseMetadata)> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.store.lock().unwrap().get(&request.url).cloned()
    }

    async fn put(&self, request: &Request, bytes: Vec<u8>, response: ResponseMetadata) {
        self.store.lock().unwrap().insert(request.url.clone(), (bytes, response));
    }
}

#[tokio::test]
async fn disk_cache_hit_skips_the_network_loader() {
    let reads = Arc::new(AtomicUsize::new(0));
    let disk_cache = Arc::new(RecordingDiskCache { store: Mutex::new(HashMap::new()), reads: reads.clone() });
    disk_cache
        .put(&Request::new("http://t/1"), b"cached-bytes".to_vec(), ResponseMetadata::default())
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(GatedLoader {
        gate: Arc::new(Notify::new()),
        gated: false,
        calls: calls.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
    });
    let (manager, _cache) = build(loader, Some(disk_cache));

    let (tx, rx) = oneshot::channel();
    let task = manager.make_task(
        Request::new("http://t/1"),
        None,
        Some(Box::new(move |r| {
            let _ = tx.send(r);
        })),
    );
    task.resume();
    let image = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap().unwrap();
    assert_eq!(image.pixels(), b"cached-bytes");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn cache_policy_does_not_affect_caching_equivalence() {
    let mut a = Request::new("http://t/1");
    a.options.cache_policy = CachePolicy::ReloadIgnoringLocalCache;
    let mut b = Request::new("http://t/1");
    b.options.cache_policy = CachePolicy::ReturnCacheDataDontLoad;
    assert!(pipeline_core::caching_equivalent(&a, &b));
}
