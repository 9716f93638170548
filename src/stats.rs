//! Pipeline-wide counters, gated behind the `stats` feature.
//!
//! A plain counters struct that logs itself via `tracing::debug!` when
//! dropped.

#[derive(Debug, Default)]
pub struct PipelineStats {
    tag: &'static str,
    tasks_created: u64,
    tasks_completed: u64,
    tasks_cancelled: u64,
    cache_hits: u64,
    cache_misses: u64,
    dedup_collapses: u64,
}

impl PipelineStats {
    pub fn new(tag: &'static str) -> Self {
        Self { tag, ..Default::default() }
    }

    pub fn record_task_created(&mut self) {
        self.tasks_created += 1;
    }

    pub fn record_task_completed(&mut self) {
        self.tasks_completed += 1;
    }

    pub fn record_task_cancelled(&mut self) {
        self.tasks_cancelled += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn record_dedup_collapse(&mut self) {
        self.dedup_collapses += 1;
    }
}

impl Drop for PipelineStats {
    fn drop(&mut self) {
        tracing::debug!(pipeline_stats = ?self, tag = self.tag);
    }
}
