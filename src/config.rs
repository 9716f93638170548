use std::time::Duration;

/// Per-stage concurrency limits. Defaults: caching and processing get a
/// small amount of parallelism, loading gets the most (it's the stage
/// actually bound by an external network), decoding is serialized to one at
/// a time.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub caching_concurrency: usize,
    pub loading_concurrency: usize,
    pub decoding_concurrency: usize,
    pub processing_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            caching_concurrency: 2,
            loading_concurrency: 8,
            decoding_concurrency: 1,
            processing_concurrency: 2,
        }
    }
}

/// Memory-cache sizing. `total_cost_limit: None` derives the limit
/// from physical memory at construction time; `Some(limit)` overrides it,
/// mainly useful for tests that want deterministic eviction behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheConfig {
    pub total_cost_limit: Option<usize>,
}

/// Prefetcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    pub max_concurrent_preheat_tasks: usize,
    pub coalesce_delay: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { max_concurrent_preheat_tasks: 3, coalesce_delay: Duration::from_millis(200) }
    }
}

/// The full set of tunables for assembling a pipeline. Not a
/// service-configuration loader (this crate is embedded, not run as its own
/// process), just a plain struct with sensible defaults, analogous to how
/// an embedded library exposes its knobs rather than reading them from a
/// file or environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineConfig {
    pub executors: ExecutorConfig,
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
}
