use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::collaborators::ProgressSink;
use crate::error::PipelineError;
use crate::image::Image;
use crate::loader::{LoadCompletion, LoadHandle, LoaderLike};
use crate::request::{Request, RequestKey};
#[cfg(feature = "stats")]
use crate::stats::PipelineStats;

/// A per-subscriber handle into a shared load. Cancelling the last remaining
/// subscription for a given key cancels the underlying load; cancelling
/// any other subscription simply removes that one listener from the fan-out.
pub struct Subscription {
    key: RequestKey,
    id: u64,
    op_tx: mpsc::UnboundedSender<DedupOp>,
}

impl Subscription {
    pub fn cancel(&self) {
        let _ = self.op_tx.send(DedupOp::Unsubscribe { key: self.key.clone(), subscriber_id: self.id });
    }
}

enum DedupOp {
    Subscribe {
        key: RequestKey,
        request: Arc<Request>,
        progress: Option<ProgressSink>,
        completion: LoadCompletion,
        response_tx: oneshot::Sender<u64>,
    },
    Unsubscribe {
        key: RequestKey,
        subscriber_id: u64,
    },
    Progress {
        key: RequestKey,
        completed: u64,
        total: u64,
    },
    Completion {
        key: RequestKey,
        result: Result<Image, PipelineError>,
    },
}

struct DedupSubscriber {
    id: u64,
    progress: Option<ProgressSink>,
    completion: Option<LoadCompletion>,
}

struct SharedLoad {
    subscribers: Vec<DedupSubscriber>,
    handle: LoadHandle,
    next_subscriber_id: u64,
}

/// Collapses concurrently-requested loading-equivalent requests into
/// one underlying `Loader::load` call, fanning progress and the final result
/// out to every subscriber.
///
/// `subscribe` is a find-or-create-then-enqueue operation, and fan-out on
/// completion dispatches per-subscriber the way a keyed batch loader resolves
/// each pending caller from a shared result, generalized here from a keyed
/// batch cache to a keyed in-flight-load registry with listener lists instead
/// of oneshot channels, since a single subscriber may need more than one
/// message (progress, then completion).
pub struct Deduplicator {
    op_tx: mpsc::UnboundedSender<DedupOp>,
    _worker: JoinHandle<()>,
}

impl Deduplicator {
    pub fn new(loader: Arc<dyn LoaderLike>) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let worker = DeduplicatorWorker {
            loader,
            op_rx,
            op_tx: op_tx.clone(),
            loads: HashMap::new(),
            #[cfg(feature = "stats")]
            stats: PipelineStats::new("deduplicator"),
        };
        let handle = tokio::spawn(worker.start());
        Self { op_tx, _worker: handle }
    }

    /// Subscribes to the load for `request`, joining an in-flight load if one
    /// is already running for a loading-equivalent request, or starting a new
    /// one otherwise.
    pub async fn subscribe(
        &self,
        request: Arc<Request>,
        progress: Option<ProgressSink>,
        completion: LoadCompletion,
    ) -> Subscription {
        let key = RequestKey::loading(request.clone());
        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.op_tx.send(DedupOp::Subscribe {
            key: key.clone(),
            request,
            progress,
            completion,
            response_tx,
        });
        let id = response_rx.await.unwrap_or(0);
        Subscription { key, id, op_tx: self.op_tx.clone() }
    }
}

struct DeduplicatorWorker {
    loader: Arc<dyn LoaderLike>,
    op_rx: mpsc::UnboundedReceiver<DedupOp>,
    op_tx: mpsc::UnboundedSender<DedupOp>,
    loads: HashMap<RequestKey, SharedLoad>,
    #[cfg(feature = "stats")]
    stats: PipelineStats,
}

impl DeduplicatorWorker {
    async fn start(mut self) {
        let span = tracing::span!(tracing::Level::TRACE, "DeduplicatorWorker");
        let _enter = span.enter();
        loop {
            match self.op_rx.recv().await {
                None => {
                    tracing::info!("op channel closed, terminating deduplicator worker");
                    return;
                }
                Some(op) => self.handle_op(op),
            }
        }
    }

    #[tracing::instrument(skip(self, op))]
    fn handle_op(&mut self, op: DedupOp) {
        match op {
            DedupOp::Subscribe { key, request, progress, completion, response_tx } => {
                self.handle_subscribe(key, request, progress, completion, response_tx);
            }
            DedupOp::Unsubscribe { key, subscriber_id } => self.handle_unsubscribe(key, subscriber_id),
            DedupOp::Progress { key, completed, total } => self.handle_progress(key, completed, total),
            DedupOp::Completion { key, result } => self.handle_completion(key, result),
        }
    }

    fn handle_subscribe(
        &mut self,
        key: RequestKey,
        request: Arc<Request>,
        progress: Option<ProgressSink>,
        completion: LoadCompletion,
        response_tx: oneshot::Sender<u64>,
    ) {
        if let Some(shared) = self.loads.get_mut(&key) {
            tracing::debug!(url = %key.request().url, "joining in-flight shared load");
            #[cfg(feature = "stats")]
            self.stats.record_dedup_collapse();
            let id = shared.next_subscriber_id;
            shared.next_subscriber_id += 1;
            shared.subscribers.push(DedupSubscriber { id, progress, completion: Some(completion) });
            let _ = response_tx.send(id);
            return;
        }

        let progress_key = key.clone();
        let progress_tx = self.op_tx.clone();
        let sink = ProgressSink::new(move |completed, total| {
            let _ = progress_tx.send(DedupOp::Progress { key: progress_key.clone(), completed, total });
        });

        let completion_key = key.clone();
        let completion_tx = self.op_tx.clone();
        let forward_completion: LoadCompletion = Box::new(move |result| {
            let _ = completion_tx.send(DedupOp::Completion { key: completion_key, result });
        });

        tracing::debug!(url = %key.request().url, "starting new shared load");
        let handle = self.loader.load(request, Some(sink), forward_completion);
        let subscriber_id = 0;
        self.loads.insert(
            key,
            SharedLoad {
                subscribers: vec![DedupSubscriber { id: subscriber_id, progress, completion: Some(completion) }],
                handle,
                next_subscriber_id: 1,
            },
        );
        let _ = response_tx.send(subscriber_id);
    }

    fn handle_unsubscribe(&mut self, key: RequestKey, subscriber_id: u64) {
        let Some(shared) = self.loads.get_mut(&key) else { return };
        if let Some(pos) = shared.subscribers.iter().position(|s| s.id == subscriber_id) {
            shared.subscribers.remove(pos);
        }
        if shared.subscribers.is_empty() {
            tracing::debug!(url = %key.request().url, "last subscriber gone, cancelling shared load");
            shared.handle.cancel();
            self.loads.remove(&key);
        }
    }

    fn handle_progress(&mut self, key: RequestKey, completed: u64, total: u64) {
        let Some(shared) = self.loads.get(&key) else { return };
        for subscriber in &shared.subscribers {
            if let Some(progress) = &subscriber.progress {
                progress.tick(completed, total);
            }
        }
    }

    fn handle_completion(&mut self, key: RequestKey, result: Result<Image, PipelineError>) {
        let Some(mut shared) = self.loads.remove(&key) else { return };
        #[cfg(feature = "stats")]
        self.stats.record_task_completed();
        for subscriber in shared.subscribers.iter_mut() {
            if let Some(completion) = subscriber.completion.take() {
                completion(result.clone());
            }
        }
    }
}
