use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Opaque wrapper around whatever transport error a `DataLoading`
/// implementation raised. Boxed behind an `Arc` so `PipelineError` stays
/// `Clone`, which the deduplicator needs to fan the same result out to every
/// subscriber.
#[derive(Clone)]
pub struct LoadingError(Arc<dyn std::error::Error + Send + Sync>);

impl LoadingError {
    pub fn new(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(cause))
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        #[derive(Debug, Error)]
        #[error("{0}")]
        struct Message(String);
        Self::new(Message(message.into()))
    }
}

impl fmt::Debug for LoadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for LoadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for LoadingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// The taxonomy a `Pipeline` (the per-request stage graph) can fail with.
/// Each variant corresponds to exactly one stage.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("loading failed: {0}")]
    LoadingFailed(#[from] LoadingError),

    #[error("decoding failed")]
    DecodingFailed,

    #[error("processing failed")]
    ProcessingFailed,
}

/// The taxonomy a `Task` completes with. A task either finishes with an
/// image, is cancelled, or surfaces the `Pipeline`'s failure as its own
/// cause.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error(transparent)]
    LoadingFailed(#[from] PipelineError),
}
