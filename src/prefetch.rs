use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use crate::config::PrefetchConfig;
use crate::manager::{Manager, Task, TaskState};
use crate::request::{Request, RequestKey};

struct PrefetcherState {
    by_key: HashMap<RequestKey, Task>,
    order: VecDeque<RequestKey>,
}

/// Background preheating on top of a `Manager`: submits suspended
/// tasks for a batch of requests and resumes them a few at a time, so
/// foreground work is never starved of stage-executor capacity by
/// speculative loads.
///
/// Uses a time-coalesced resume pass: a burst of `start_preheating` calls or
/// task-state changes collapses into a single pass after `coalesce_delay`
/// (default 200ms) rather than firing once per trigger.
pub struct Prefetcher {
    manager: Arc<Manager>,
    state: Arc<Mutex<PrefetcherState>>,
    resume_tx: mpsc::UnboundedSender<()>,
}

impl Prefetcher {
    pub fn new(manager: Arc<Manager>, config: PrefetchConfig) -> Self {
        let state = Arc::new(Mutex::new(PrefetcherState { by_key: HashMap::new(), order: VecDeque::new() }));
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let state_changes = manager.subscribe_state_changes();

        tokio::spawn(Self::run(manager.clone(), state.clone(), config, state_changes, resume_rx));

        Self { manager, state, resume_tx }
    }

    /// Queues `requests` for background loading. Requests that are
    /// loading-equivalent to one already queued or in flight are ignored;
    /// the preheat dedup key is always loading-equivalence, not
    /// caching-equivalence.
    pub fn start_preheating(&self, requests: Vec<Request>) {
        {
            let mut state = self.state.lock().unwrap();
            for request in requests {
                let request = Arc::new(request);
                let key = RequestKey::loading(request.clone());
                if state.by_key.contains_key(&key) {
                    continue;
                }

                let completion_state = self.state.clone();
                let completion_key = key.clone();
                let completion: crate::manager::CompletionCallback = Box::new(move |_result| {
                    let mut state = completion_state.lock().unwrap();
                    state.by_key.remove(&completion_key);
                    state.order.retain(|k| k != &completion_key);
                });

                let task = self.manager.make_task((*request).clone(), None, Some(completion));
                state.order.push_back(key.clone());
                state.by_key.insert(key, task);
            }
        }
        let _ = self.resume_tx.send(());
    }

    /// Cancels preheating for any currently-queued requests loading-equivalent
    /// to one of `requests`. Already-promoted foreground tasks (resumed
    /// through `Manager` directly, not through this prefetcher) are
    /// untouched.
    pub fn stop_preheating(&self, requests: &[Request]) {
        let state = self.state.lock().unwrap();
        for request in requests {
            let key = RequestKey::loading(Arc::new(request.clone()));
            if let Some(task) = state.by_key.get(&key) {
                task.cancel();
            }
        }
    }

    pub fn stop_preheating_all(&self) {
        let state = self.state.lock().unwrap();
        for task in state.by_key.values() {
            task.cancel();
        }
    }

    async fn run(
        manager: Arc<Manager>,
        state: Arc<Mutex<PrefetcherState>>,
        config: PrefetchConfig,
        mut state_changes: broadcast::Receiver<crate::manager::TaskStateChange>,
        mut resume_rx: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            tokio::select! {
                result = state_changes.recv() => {
                    if matches!(result, Err(broadcast::error::RecvError::Closed)) {
                        return;
                    }
                }
                trigger = resume_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
            }

            tokio::time::sleep(config.coalesce_delay).await;
            Self::drain(&mut state_changes, &mut resume_rx);
            Self::resume_pass(&manager, &state, &config);
        }
    }

    fn drain(state_changes: &mut broadcast::Receiver<crate::manager::TaskStateChange>, resume_rx: &mut mpsc::UnboundedReceiver<()>) {
        while state_changes.try_recv().is_ok() {}
        while resume_rx.try_recv().is_ok() {}
    }

    #[tracing::instrument(skip_all)]
    fn resume_pass(manager: &Manager, state: &Mutex<PrefetcherState>, config: &PrefetchConfig) {
        let state = state.lock().unwrap();
        let running_count = manager.tasks().len();
        let mut slots = config.max_concurrent_preheat_tasks.saturating_sub(running_count);
        tracing::trace!(running_count, slots, "prefetch resume pass");
        if slots == 0 {
            return;
        }
        for key in state.order.iter() {
            if slots == 0 {
                break;
            }
            if let Some(task) = state.by_key.get(key) {
                if task.state() == TaskState::Suspended {
                    tracing::debug!(url = %key.request().url, "resuming preheat task");
                    task.resume();
                    slots -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::collaborators::{DataCaching, DataDecoding, DataLoading, ProgressSink, ResponseMetadata};
    use crate::dedup::Deduplicator;
    use crate::error::LoadingError;
    use crate::image::Image;
    use crate::loader::{Loader, PipelineCollaborators, StageExecutors};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct InstantLoader {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataLoading for InstantLoader {
        async fn load(
            &self,
            _request: &Request,
            _progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<(Vec<u8>, ResponseMetadata), LoadingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((vec![1, 2, 3, 4], ResponseMetadata::default()))
        }
    }

    struct StubDecoder;

    #[async_trait]
    impl DataDecoding for StubDecoder {
        async fn decode(&self, bytes: &[u8], _response: &ResponseMetadata) -> Option<Image> {
            Some(Image::new(1, 1, bytes.len() as u32, bytes.to_vec()))
        }
    }

    fn build_manager() -> (Arc<Manager>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Loader::new(
            PipelineCollaborators {
                data_loader: Arc::new(InstantLoader { calls: calls.clone() }),
                decoder: Arc::new(StubDecoder),
                disk_cache: None,
            },
            Arc::new(StageExecutors::default()),
        );
        let dedup = Arc::new(Deduplicator::new(Arc::new(loader)));
        let cache = Arc::new(MemoryCache::new(1024 * 1024));
        (Arc::new(Manager::new(dedup, cache)), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn preheated_requests_eventually_resume() {
        let (manager, calls) = build_manager();
        let prefetcher = Prefetcher::new(manager, PrefetchConfig { max_concurrent_preheat_tasks: 3, coalesce_delay: Duration::from_millis(200) });

        prefetcher.start_preheating(vec![Request::new("https://example.com/a.png")]);
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_of_start_preheating_calls_coalesces_into_one_pass() {
        let (manager, calls) = build_manager();
        let prefetcher = Prefetcher::new(manager, PrefetchConfig { max_concurrent_preheat_tasks: 3, coalesce_delay: Duration::from_millis(200) });

        for i in 0..3 {
            prefetcher.start_preheating(vec![Request::new(format!("https://example.com/{i}.png"))]);
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
