use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LoadingError;
use crate::image::Image;
use crate::request::{Request, RequestKey};

/// Progress ticks reported by a `DataLoading` implementation while it's
/// fetching bytes for a request. Cheaply cloneable so the deduplicator can
/// hand the same sink (indirectly) to every subscriber of a shared load.
#[derive(Clone)]
pub struct ProgressSink(std::sync::Arc<dyn Fn(u64, u64) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self(std::sync::Arc::new(f))
    }

    pub fn tick(&self, completed: u64, total: u64) {
        (self.0)(completed, total)
    }
}

/// Response metadata returned alongside the raw bytes from a load. Kept
/// intentionally small: this crate doesn't interpret HTTP headers itself,
/// it just threads whatever the collaborator hands back through to the
/// decoder and the disk cache.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub content_type: Option<String>,
    pub byte_len: Option<u64>,
}

/// The network/transport collaborator. Implementations own everything
/// about how a URL turns into bytes: HTTP, a local filesystem, an asset
/// bundle, whatever.
///
/// Cancellation: the `loading` stage executor races this call against a
/// `CancellationToken` internally, so implementations don't strictly need to
/// observe `cancel` themselves to be cancellable from the caller's point of
/// view, but a well-behaved implementation should still watch it to stop
/// wasting bandwidth on a request nobody wants anymore.
#[async_trait]
pub trait DataLoading: Send + Sync {
    async fn load(
        &self,
        request: &Request,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(Vec<u8>, ResponseMetadata), LoadingError>;
}

/// Turns raw bytes into a decoded `Image`. Returning `None` is a
/// decoding failure, not "unsupported, try the next decoder"; this crate
/// has no decoder-chaining concept, a single `DataDecoding` handles whatever
/// formats the embedding application cares about.
#[async_trait]
pub trait DataDecoding: Send + Sync {
    async fn decode(&self, bytes: &[u8], response: &ResponseMetadata) -> Option<Image>;
}

/// Optional on-disk cache sitting between the loading stage and the network:
/// a hit here skips `DataLoading` entirely. Implementations are
/// expected to be resilient to misses (`get` returning `None` is the common
/// case, not an error) and to tolerate being written to from a detached task
/// (the pipeline writes through after a successful load without waiting for
/// the write to land).
#[async_trait]
pub trait DataCaching: Send + Sync {
    async fn get(&self, request: &Request) -> Option<(Vec<u8>, ResponseMetadata)>;

    async fn put(&self, request: &Request, bytes: Vec<u8>, response: ResponseMetadata);
}

/// The in-memory image cache interface. `MemoryCache` is this crate's
/// concrete, cost-bounded LRU implementation; the trait exists so the
/// `Manager` doesn't hard-depend on that specific eviction policy.
pub trait ImageCaching: Send + Sync {
    fn get(&self, key: &RequestKey) -> Option<Image>;
    fn put(&self, key: RequestKey, image: Image);
    fn remove(&self, key: &RequestKey);
    fn clear(&self);
}
