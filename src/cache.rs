use std::sync::Mutex;

use lru::LruCache;

use crate::collaborators::ImageCaching;
use crate::image::Image;
use crate::request::RequestKey;

/// The default physical-memory-based sizing rule: 10% of physical memory up
/// to 512MB total, 20% above that.
fn default_total_cost_limit() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_bytes = system.total_memory() as usize;
    const HALF_GB: usize = 512 * 1024 * 1024;
    if total_bytes <= HALF_GB {
        total_bytes / 10
    } else {
        total_bytes / 5
    }
}

struct Inner {
    entries: LruCache<RequestKey, (Image, usize)>,
    total_cost: usize,
}

/// A cost-bounded, least-recently-used in-memory image cache, keyed by
/// caching-equivalent `RequestKey`s.
///
/// Built on top of a plain key/value `Cache` shape (`get`/`insert`/`remove`/
/// `flush`), generalized from an unbounded map to a cost-bounded LRU backed
/// by the `lru` crate, tracking `total_cost` ourselves since eviction here is
/// driven by aggregate cost rather than entry count.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    total_cost_limit: usize,
}

impl MemoryCache {
    pub fn new(total_cost_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: LruCache::unbounded(), total_cost: 0 }),
            total_cost_limit,
        }
    }

    /// Sizes the cache from physical memory using the default sizing rule.
    pub fn with_default_limit() -> Self {
        Self::new(default_total_cost_limit())
    }

    pub fn total_cost_limit(&self) -> usize {
        self.total_cost_limit
    }

    pub fn total_cost(&self) -> usize {
        self.inner.lock().unwrap().total_cost
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageCaching for MemoryCache {
    fn get(&self, key: &RequestKey) -> Option<Image> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|(image, _)| image.clone())
    }

    fn put(&self, key: RequestKey, image: Image) {
        let cost = image.estimate_cost();
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, old_cost)) = inner.entries.peek(&key) {
            inner.total_cost -= *old_cost;
        }
        inner.entries.put(key, (image, cost));
        inner.total_cost += cost;
        while inner.total_cost > self.total_cost_limit {
            match inner.entries.pop_lru() {
                Some((_, (_, evicted_cost))) => inner.total_cost -= evicted_cost,
                None => break,
            }
        }
    }

    fn remove(&self, key: &RequestKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, cost)) = inner.entries.pop(key) {
            inner.total_cost -= cost;
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.total_cost = 0;
    }
}
