//! Core of an async image-retrieval pipeline: disk-cache lookup, network
//! fetch, decode and processing, behind request deduplication, a memory
//! cache, and a task manager with cooperative cancellation and background
//! prefetching.
//!
//! The crate has no opinion on transport, image format, or decoded
//! representation; those are supplied by implementing the collaborator
//! traits in [`collaborators`] and handed to a [`Loader`].
//!
//! A pipeline is assembled bottom-up:
//!
//! ```ignore
//! let executors = Arc::new(StageExecutors::default());
//! let loader = Loader::new(collaborators, executors);
//! let dedup = Arc::new(Deduplicator::new(Arc::new(loader)));
//! let cache = Arc::new(MemoryCache::with_default_limit());
//! let manager = Arc::new(Manager::new(dedup, cache));
//! let prefetcher = Prefetcher::new(manager.clone(), PrefetchConfig::default());
//! ```

mod cache;
mod collaborators;
mod config;
mod dedup;
mod error;
mod executor;
mod image;
mod loader;
mod manager;
mod prefetch;
mod processor;
mod request;

#[cfg(feature = "stats")]
mod stats;

pub use cache::MemoryCache;
pub use collaborators::{DataCaching, DataLoading, DataDecoding, ImageCaching, ProgressSink, ResponseMetadata};
pub use config::{CacheConfig, ExecutorConfig, PipelineConfig, PrefetchConfig};
pub use dedup::{Deduplicator, Subscription};
pub use error::{LoadingError, PipelineError, TaskError};
pub use executor::{Cancellable, StageExecutor};
pub use image::Image;
pub use loader::{LoadCompletion, LoadHandle, Loader, LoaderLike, PipelineCollaborators, StageExecutors};
pub use manager::{CompletionCallback, Manager, ProgressCallback, Task, TaskState, TaskStateChange};
pub use prefetch::Prefetcher;
pub use processor::{Processor, ProcessorList};
pub use request::{
    caching_equivalent, loading_equivalent, CachePolicy, Equivalence, Request, RequestKey, RequestOptions,
    ServiceClass,
};

#[cfg(feature = "stats")]
pub use stats::PipelineStats;

/// Assembles the default pipeline topology from a set of collaborators and a
/// configuration, wiring `Loader` -> `Deduplicator` -> `Manager` ->
/// `Prefetcher` the way every caller of this crate ends up doing by hand
/// otherwise.
pub struct Pipeline {
    pub manager: std::sync::Arc<Manager>,
    pub prefetcher: Prefetcher,
}

impl Pipeline {
    pub fn new(collaborators: PipelineCollaborators, config: PipelineConfig) -> Self {
        let executors = std::sync::Arc::new(StageExecutors::new(
            config.executors.caching_concurrency,
            config.executors.loading_concurrency,
            config.executors.decoding_concurrency,
            config.executors.processing_concurrency,
        ));
        let loader = Loader::new(collaborators, executors);
        let dedup = std::sync::Arc::new(Deduplicator::new(std::sync::Arc::new(loader)));
        let cache = std::sync::Arc::new(match config.cache.total_cost_limit {
            Some(limit) => MemoryCache::new(limit),
            None => MemoryCache::with_default_limit(),
        });
        let manager = std::sync::Arc::new(Manager::new(dedup, cache));
        let prefetcher = Prefetcher::new(manager.clone(), config.prefetch);
        Self { manager, prefetcher }
    }
}
