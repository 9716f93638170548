use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cache::MemoryCache;
use crate::collaborators::ImageCaching;
use crate::dedup::{Deduplicator, Subscription};
use crate::error::{PipelineError, TaskError};
use crate::image::Image;
use crate::request::{Request, RequestKey};
#[cfg(feature = "stats")]
use crate::stats::PipelineStats;

pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type CompletionCallback = Box<dyn FnOnce(Result<Image, TaskError>) + Send>;

/// A `Task`'s lifecycle: created `Suspended`, moved to `Running` on
/// resume, and settling into exactly one of the two terminal states.
/// Terminal states are stable, every operation on a terminal task is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Suspended,
    Running,
    Completed,
    Cancelled,
}

/// Broadcast when a task changes state, so collaborators like `Prefetcher`
/// can react without polling `Manager::tasks()`.
#[derive(Debug, Clone, Copy)]
pub struct TaskStateChange {
    pub id: u64,
    pub state: TaskState,
}

struct TaskShared {
    state: Mutex<TaskState>,
    progress: Mutex<(u64, u64)>,
}

/// A caller-facing handle to one submitted request. Cheap to clone; every
/// clone observes the same underlying state.
#[derive(Clone)]
pub struct Task {
    id: u64,
    request: Arc<Request>,
    shared: Arc<TaskShared>,
    manager_tx: mpsc::UnboundedSender<ManagerOp>,
}

impl Task {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state.lock().unwrap()
    }

    pub fn progress(&self) -> (u64, u64) {
        *self.shared.progress.lock().unwrap()
    }

    /// Moves a `Suspended` task to `Running`. A no-op on any other state.
    pub fn resume(&self) {
        let _ = self.manager_tx.send(ManagerOp::Resume(self.id));
    }

    /// Cancels a `Suspended` or `Running` task. A no-op on any other state.
    pub fn cancel(&self) {
        let _ = self.manager_tx.send(ManagerOp::Cancel(self.id));
    }
}

struct TaskRecord {
    request: Arc<Request>,
    shared: Arc<TaskShared>,
    memory_cache_read: bool,
    memory_cache_write: bool,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
    subscription: Option<Subscription>,
}

enum ManagerOp {
    Register {
        id: u64,
        request: Arc<Request>,
        shared: Arc<TaskShared>,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    },
    Resume(u64),
    Cancel(u64),
    LoaderProgress {
        id: u64,
        completed: u64,
        total: u64,
    },
    LoaderResult {
        id: u64,
        result: Result<Image, PipelineError>,
    },
}

/// Executes closures in the order they were posted, one at a time, on a
/// dedicated task. The `Manager` dispatches every progress tick and
/// completion through this lane rather than calling callbacks inline from its
/// own actor loop, so a slow or panicking callback can never wedge
/// task-state bookkeeping.
struct CallbackLane {
    tx: mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl CallbackLane {
    fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback();
            }
        });
        Self { tx }
    }

    fn post(&self, callback: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(callback));
    }
}

/// Owns the in-flight task registry and the memory cache, and is the
/// entry point the rest of the crate (and embedders) talk to.
///
/// A thin public façade whose methods post to a private actor task. State
/// *transitions*
/// (`resume`, `cancel`, loader callbacks) are serialized through the actor;
/// plain reads (`tasks()`, `image_for()`) go straight to the shared,
/// independently-synchronized registry/cache so they never wait behind a
/// transition.
pub struct Manager {
    op_tx: mpsc::UnboundedSender<ManagerOp>,
    next_id: AtomicU64,
    cache: Arc<MemoryCache>,
    running: Arc<Mutex<HashMap<u64, Task>>>,
    state_changes: broadcast::Sender<TaskStateChange>,
    _worker: JoinHandle<()>,
}

impl Manager {
    pub fn new(dedup: Arc<Deduplicator>, cache: Arc<MemoryCache>) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(1024);
        let running = Arc::new(Mutex::new(HashMap::new()));
        let worker = ManagerWorker {
            op_rx,
            op_tx: op_tx.clone(),
            dedup,
            cache: cache.clone(),
            tasks: HashMap::new(),
            running: running.clone(),
            state_changes: state_tx.clone(),
            callback_lane: CallbackLane::new(),
            #[cfg(feature = "stats")]
            stats: PipelineStats::new("manager"),
        };
        let handle = tokio::spawn(worker.start());
        Self {
            op_tx,
            next_id: AtomicU64::new(1),
            cache,
            running,
            state_changes: state_tx,
            _worker: handle,
        }
    }

    /// Creates (but does not start) a task for `request`. `progress` and
    /// `completion` are optional observer slots fixed at creation time.
    pub fn make_task(
        &self,
        request: Request,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Task {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Arc::new(request);
        let shared = Arc::new(TaskShared { state: Mutex::new(TaskState::Suspended), progress: Mutex::new((0, 0)) });
        let task = Task { id, request: request.clone(), shared: shared.clone(), manager_tx: self.op_tx.clone() };
        let _ = self.op_tx.send(ManagerOp::Register { id, request, shared, progress, completion });
        task
    }

    /// Currently-running tasks (a point-in-time snapshot).
    pub fn tasks(&self) -> Vec<Task> {
        self.running.lock().unwrap().values().cloned().collect()
    }

    /// Reads the memory cache directly by caching-equivalent key, without
    /// creating a task.
    pub fn image_for(&self, request: &Request) -> Option<Image> {
        self.cache.get(&RequestKey::caching(Arc::new(request.clone())))
    }

    pub fn set_image(&self, image: Image, request: &Request) {
        self.cache.put(RequestKey::caching(Arc::new(request.clone())), image);
    }

    pub fn remove_image(&self, request: &Request) {
        self.cache.remove(&RequestKey::caching(Arc::new(request.clone())));
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<TaskStateChange> {
        self.state_changes.subscribe()
    }
}

struct ManagerWorker {
    op_rx: mpsc::UnboundedReceiver<ManagerOp>,
    op_tx: mpsc::UnboundedSender<ManagerOp>,
    dedup: Arc<Deduplicator>,
    cache: Arc<MemoryCache>,
    tasks: HashMap<u64, TaskRecord>,
    running: Arc<Mutex<HashMap<u64, Task>>>,
    state_changes: broadcast::Sender<TaskStateChange>,
    callback_lane: CallbackLane,
    #[cfg(feature = "stats")]
    stats: PipelineStats,
}

impl ManagerWorker {
    async fn start(mut self) {
        let span = tracing::span!(tracing::Level::TRACE, "ManagerWorker");
        let _enter = span.enter();
        loop {
            match self.op_rx.recv().await {
                None => {
                    tracing::info!("op channel closed, terminating manager worker");
                    return;
                }
                Some(op) => self.handle_op(op).await,
            }
        }
    }

    #[tracing::instrument(skip(self, op))]
    async fn handle_op(&mut self, op: ManagerOp) {
        match op {
            ManagerOp::Register { id, request, shared, progress, completion } => {
                let memory_cache_read = request.memory_cache_read;
                let memory_cache_write = request.memory_cache_write;
                self.tasks.insert(
                    id,
                    TaskRecord { request, shared, memory_cache_read, memory_cache_write, progress, completion, subscription: None },
                );
                #[cfg(feature = "stats")]
                self.stats.record_task_created();
            }
            ManagerOp::Resume(id) => self.handle_resume(id).await,
            ManagerOp::Cancel(id) => self.handle_cancel(id),
            ManagerOp::LoaderProgress { id, completed, total } => self.handle_loader_progress(id, completed, total),
            ManagerOp::LoaderResult { id, result } => self.handle_loader_result(id, result),
        }
    }

    fn notify_state_change(&self, id: u64, state: TaskState) {
        let _ = self.state_changes.send(TaskStateChange { id, state });
    }

    fn to_task_handle(&self, id: u64) -> Option<Task> {
        let record = self.tasks.get(&id)?;
        Some(Task { id, request: record.request.clone(), shared: record.shared.clone(), manager_tx: self.op_tx.clone() })
    }

    async fn handle_resume(&mut self, id: u64) {
        let Some(current_state) = self.tasks.get(&id).map(|r| *r.shared.state.lock().unwrap()) else { return };
        if current_state != TaskState::Suspended {
            return;
        }

        let memory_cache_read = self.tasks[&id].memory_cache_read;
        if memory_cache_read {
            let key = RequestKey::caching(self.tasks[&id].request.clone());
            if let Some(image) = self.cache.get(&key) {
                tracing::debug!(task = id, "memory cache hit, completing synchronously");
                #[cfg(feature = "stats")]
                self.stats.record_cache_hit();
                self.finish(id, TaskState::Completed, Ok(image));
                return;
            }
            #[cfg(feature = "stats")]
            self.stats.record_cache_miss();
        }

        {
            let record = self.tasks.get(&id).unwrap();
            *record.shared.state.lock().unwrap() = TaskState::Running;
        }
        self.notify_state_change(id, TaskState::Running);
        if let Some(task) = self.to_task_handle(id) {
            self.running.lock().unwrap().insert(id, task);
        }

        let request = self.tasks[&id].request.clone();
        let progress_tx = self.op_tx.clone();
        let progress_sink = crate::collaborators::ProgressSink::new(move |completed, total| {
            let _ = progress_tx.send(ManagerOp::LoaderProgress { id, completed, total });
        });
        let completion_tx = self.op_tx.clone();
        let completion: crate::loader::LoadCompletion = Box::new(move |result| {
            let _ = completion_tx.send(ManagerOp::LoaderResult { id, result });
        });

        let subscription = self.dedup.subscribe(request, Some(progress_sink), completion).await;

        match self.tasks.get_mut(&id) {
            Some(record) if *record.shared.state.lock().unwrap() == TaskState::Running => {
                record.subscription = Some(subscription);
            }
            _ => subscription.cancel(),
        }
    }

    #[tracing::instrument(skip(self))]
    fn handle_cancel(&mut self, id: u64) {
        let Some(current_state) = self.tasks.get(&id).map(|r| *r.shared.state.lock().unwrap()) else { return };
        match current_state {
            TaskState::Suspended => {
                tracing::debug!("cancelling suspended task");
                self.finish(id, TaskState::Cancelled, Err(TaskError::Cancelled));
            }
            TaskState::Running => {
                tracing::debug!("cancelling running task, cancelling underlying load");
                if let Some(record) = self.tasks.get_mut(&id) {
                    if let Some(subscription) = record.subscription.take() {
                        subscription.cancel();
                    }
                }
                self.finish(id, TaskState::Cancelled, Err(TaskError::Cancelled));
            }
            TaskState::Completed | TaskState::Cancelled => {}
        }
    }

    fn handle_loader_progress(&mut self, id: u64, completed: u64, total: u64) {
        let Some(record) = self.tasks.get(&id) else { return };
        if *record.shared.state.lock().unwrap() != TaskState::Running {
            return;
        }
        *record.shared.progress.lock().unwrap() = (completed, total);
        if let Some(callback) = record.progress.clone() {
            self.callback_lane.post(move || callback(completed, total));
        }
    }

    fn handle_loader_result(&mut self, id: u64, result: Result<Image, PipelineError>) {
        match result {
            Ok(image) => {
                if let Some(record) = self.tasks.get(&id) {
                    if record.memory_cache_write {
                        let key = RequestKey::caching(record.request.clone());
                        self.cache.put(key, image.clone());
                    }
                }
                self.finish(id, TaskState::Completed, Ok(image));
            }
            Err(cause) => {
                tracing::warn!(task = id, error = %cause, "task failed");
                self.finish(id, TaskState::Completed, Err(TaskError::LoadingFailed(cause)));
            }
        }
    }

    /// Common terminal-transition path: stamps the final state, notifies
    /// watchers, drops the task out of the running registry, and dispatches
    /// the completion callback (if any) on the callback lane.
    fn finish(&mut self, id: u64, state: TaskState, result: Result<Image, TaskError>) {
        let Some(mut record) = self.tasks.remove(&id) else { return };
        *record.shared.state.lock().unwrap() = state;
        self.notify_state_change(id, state);
        self.running.lock().unwrap().remove(&id);
        #[cfg(feature = "stats")]
        match state {
            TaskState::Cancelled => self.stats.record_task_cancelled(),
            TaskState::Completed => self.stats.record_task_completed(),
            _ => {}
        }
        if let Some(completion) = record.completion.take() {
            self.callback_lane.post(move || completion(result));
        }
    }
}
