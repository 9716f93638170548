use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::collaborators::{DataCaching, DataDecoding, DataLoading, ProgressSink};
use crate::error::PipelineError;
use crate::executor::StageExecutor;
use crate::image::Image;
use crate::request::Request;

pub type LoadCompletion = Box<dyn FnOnce(Result<Image, PipelineError>) + Send>;

/// The four stage executors a `Pipeline` drives a request through, with
/// their default concurrencies.
pub struct StageExecutors {
    pub caching: StageExecutor,
    pub loading: StageExecutor,
    pub decoding: StageExecutor,
    pub processing: StageExecutor,
}

impl StageExecutors {
    pub fn new(caching: usize, loading: usize, decoding: usize, processing: usize) -> Self {
        Self {
            caching: StageExecutor::new("caching", caching),
            loading: StageExecutor::new("loading", loading),
            decoding: StageExecutor::new("decoding", decoding),
            processing: StageExecutor::new("processing", processing),
        }
    }
}

impl Default for StageExecutors {
    fn default() -> Self {
        Self::new(2, 8, 1, 2)
    }
}

/// The pluggable collaborators a `Pipeline` needs: a network loader, a
/// decoder, and an optional disk cache in front of the network.
#[derive(Clone)]
pub struct PipelineCollaborators {
    pub data_loader: Arc<dyn DataLoading>,
    pub decoder: Arc<dyn DataDecoding>,
    pub disk_cache: Option<Arc<dyn DataCaching>>,
}

/// One request's cancellable run through the stage graph. Dropping this
/// handle leaves the run in progress; call `cancel()` to stop it.
pub struct LoadHandle {
    token: CancellationToken,
}

impl LoadHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Builds a standalone handle for tests that stub out `LoaderLike`
    /// without running a real stage pipeline underneath it.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self { token: CancellationToken::new() }
    }
}

/// Something shaped like a `Loader::load` call, the interface the
/// deduplicator wraps. `Loader` is the only implementation in this crate,
/// but keeping it behind a trait lets tests substitute a stub pipeline
/// without spinning up real stage executors.
pub trait LoaderLike: Send + Sync {
    fn load(&self, request: Arc<Request>, progress: Option<ProgressSink>, completion: LoadCompletion) -> LoadHandle;
}

/// Drives one request through disk-cache lookup, network load, decode and
/// processing, each stage running on its own bounded `StageExecutor`.
///
/// A single task owns the whole run from start to finish, checking for
/// cancellation between stages before handing off to the next one.
pub struct Loader {
    collaborators: PipelineCollaborators,
    executors: Arc<StageExecutors>,
}

impl Loader {
    pub fn new(collaborators: PipelineCollaborators, executors: Arc<StageExecutors>) -> Self {
        Self { collaborators, executors }
    }
}

impl LoaderLike for Loader {
    #[tracing::instrument(skip(self, progress, completion), fields(url = %request.url))]
    fn load(&self, request: Arc<Request>, progress: Option<ProgressSink>, completion: LoadCompletion) -> LoadHandle {
        let token = CancellationToken::new();
        let run_token = token.clone();
        let executors = self.executors.clone();
        let collaborators = self.collaborators.clone();
        tokio::spawn(run_pipeline(request, progress, completion, executors, collaborators, run_token));
        LoadHandle { token }
    }
}

#[tracing::instrument(skip_all, fields(url = %request.url))]
async fn run_pipeline(
    request: Arc<Request>,
    progress: Option<ProgressSink>,
    completion: LoadCompletion,
    executors: Arc<StageExecutors>,
    collaborators: PipelineCollaborators,
    token: CancellationToken,
) {
    macro_rules! bail_if_cancelled {
        () => {
            if token.is_cancelled() {
                tracing::trace!("pipeline cancelled between stages");
                return;
            }
        };
    }

    // Stage 1: disk cache lookup.
    let cached = match &collaborators.disk_cache {
        Some(disk_cache) => {
            let disk_cache = disk_cache.clone();
            let req = request.clone();
            executors
                .caching
                .spawn_async(token.clone(), async move { disk_cache.get(&req).await })
                .join()
                .await
                .flatten()
        }
        None => None,
    };

    bail_if_cancelled!();

    let (bytes, response) = match cached {
        Some(pair) => pair,
        None => {
            // Stage 2: network load.
            let data_loader = collaborators.data_loader.clone();
            let req = request.clone();
            let tick_progress = progress.clone();
            let load_token = token.clone();
            let sink = ProgressSink::new(move |completed, total| {
                if let Some(progress) = &tick_progress {
                    progress.tick(completed, total);
                }
            });
            let unit = executors.loading.spawn_async(token.clone(), async move {
                data_loader.load(&req, sink, load_token).await
            });
            match unit.join().await {
                Some(Ok((bytes, response))) => {
                    if let Some(disk_cache) = &collaborators.disk_cache {
                        let disk_cache = disk_cache.clone();
                        let req = request.clone();
                        let write_bytes = bytes.clone();
                        let write_response = response.clone();
                        tokio::spawn(async move {
                            disk_cache.put(&req, write_bytes, write_response).await;
                        });
                    }
                    (bytes, response)
                }
                Some(Err(cause)) => {
                    tracing::warn!(url = %request.url, error = %cause, "loading failed");
                    completion(Err(PipelineError::LoadingFailed(cause)));
                    return;
                }
                None => return,
            }
        }
    };

    bail_if_cancelled!();

    // Stage 3: decode.
    let decoder = collaborators.decoder.clone();
    let decode_bytes = bytes.clone();
    let decode_response = response.clone();
    let unit = executors
        .decoding
        .spawn_async(token.clone(), async move { decoder.decode(&decode_bytes, &decode_response).await });
    let image = match unit.join().await {
        Some(Some(image)) => image,
        Some(None) => {
            tracing::warn!(url = %request.url, "decoding failed");
            completion(Err(PipelineError::DecodingFailed));
            return;
        }
        None => return,
    };

    bail_if_cancelled!();

    // Stage 4: processing.
    if request.processors.is_empty() {
        completion(Ok(image));
        return;
    }
    let processors = request.processors.clone();
    let unit = executors.processing.spawn_plain(token.clone(), move || processors.apply(image));
    match unit.join().await {
        Some(Some(image)) => completion(Ok(image)),
        Some(None) => {
            tracing::warn!(url = %request.url, "processing failed");
            completion(Err(PipelineError::ProcessingFailed));
        }
        None => {}
    }
}
