use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::processor::ProcessorList;

/// Caller-facing cache policy. Mirrors the handful of modes every HTTP
/// stack ends up with; the loading collaborator decides how to honour it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    UseProtocolCachePolicy,
    ReloadIgnoringLocalCache,
    ReturnCacheDataElseLoad,
    ReturnCacheDataDontLoad,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::UseProtocolCachePolicy
    }
}

/// Hints the loading collaborator may use to schedule underneath its own
/// transport (priority, not a guarantee).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceClass {
    Interactive,
    Default,
    Background,
}

impl Default for ServiceClass {
    fn default() -> Self {
        ServiceClass::Default
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestOptions {
    pub cache_policy: CachePolicy,
    pub timeout: Option<Duration>,
    pub service_class: ServiceClass,
    pub cellular_allowed: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::default(),
            timeout: None,
            service_class: ServiceClass::default(),
            cellular_allowed: true,
        }
    }
}

/// Everything needed to retrieve and produce one image, once: a URL, the
/// options that govern how it's fetched, the processors to run on the
/// decoded result, and the two cache-participation flags.
///
/// Immutable once submitted to a `Task`, the whole pipeline treats `&Request`
/// (or a shared `Arc<Request>`) as read-only.
#[derive(Clone)]
pub struct Request {
    pub url: String,
    pub options: RequestOptions,
    pub processors: ProcessorList,
    pub memory_cache_read: bool,
    pub memory_cache_write: bool,
    pub user_info: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("options", &self.options)
            .field("processors", &self.processors)
            .field("memory_cache_read", &self.memory_cache_read)
            .field("memory_cache_write", &self.memory_cache_write)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: RequestOptions::default(),
            processors: ProcessorList::default(),
            memory_cache_read: true,
            memory_cache_write: true,
            user_info: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_processors(mut self, processors: ProcessorList) -> Self {
        self.processors = processors;
        self
    }
}

/// Two requests are "loading-equivalent" if a single underlying fetch+decode
/// could serve both of them: same URL, same cache policy, same timeout, same
/// service class, same cellular-allowed flag, same processors. This is the
/// predicate the deduplicator and the prefetcher key on.
pub fn loading_equivalent(a: &Request, b: &Request) -> bool {
    a.url == b.url
        && a.options.cache_policy == b.options.cache_policy
        && a.options.timeout == b.options.timeout
        && a.options.service_class == b.options.service_class
        && a.options.cellular_allowed == b.options.cellular_allowed
        && a.processors == b.processors
}

/// Two requests are "caching-equivalent" if they should land on the same
/// memory-cache slot: same URL and same processors, cache policy doesn't
/// matter because the cache stores the final processed image regardless of
/// how it got there.
pub fn caching_equivalent(a: &Request, b: &Request) -> bool {
    a.url == b.url && a.processors == b.processors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equivalence {
    Loading,
    Caching,
}

/// A hashable wrapper around `Arc<Request>` whose `Eq`/`Hash` are governed by
/// one of the two equivalence predicates above rather than `Request`'s own
/// (nonexistent) structural equality. All keys sharing a map must be built
/// with the same `Equivalence`.
#[derive(Clone)]
pub struct RequestKey {
    request: Arc<Request>,
    equivalence: Equivalence,
}

impl RequestKey {
    pub fn new(request: Arc<Request>, equivalence: Equivalence) -> Self {
        Self { request, equivalence }
    }

    pub fn loading(request: Arc<Request>) -> Self {
        Self::new(request, Equivalence::Loading)
    }

    pub fn caching(request: Arc<Request>) -> Self {
        Self::new(request, Equivalence::Caching)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestKey")
            .field("equivalence", &self.equivalence)
            .field("url", &self.request.url)
            .finish()
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        debug_assert_eq!(
            self.equivalence, other.equivalence,
            "RequestKey values from different equivalence classes were compared"
        );
        match self.equivalence {
            Equivalence::Loading => loading_equivalent(&self.request, &other.request),
            Equivalence::Caching => caching_equivalent(&self.request, &other.request),
        }
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Both equivalence classes agree that same URL is necessary for
        // equality, so hashing on URL alone keeps equal keys in the same
        // bucket without over-constraining the hash.
        self.request.url.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorList;

    fn req(url: &str) -> Arc<Request> {
        Arc::new(Request::new(url))
    }

    #[test]
    fn loading_keys_equal_for_same_url_and_policy() {
        let a = RequestKey::loading(req("https://example.com/a.png"));
        let b = RequestKey::loading(req("https://example.com/a.png"));
        assert_eq!(a, b);
    }

    #[test]
    fn loading_keys_differ_for_different_urls() {
        let a = RequestKey::loading(req("https://example.com/a.png"));
        let b = RequestKey::loading(req("https://example.com/b.png"));
        assert_ne!(a, b);
    }

    #[test]
    fn caching_keys_ignore_cache_policy() {
        let mut r1 = Request::new("https://example.com/a.png");
        r1.options.cache_policy = CachePolicy::ReloadIgnoringLocalCache;
        let mut r2 = Request::new("https://example.com/a.png");
        r2.options.cache_policy = CachePolicy::ReturnCacheDataDontLoad;
        let a = RequestKey::caching(Arc::new(r1));
        let b = RequestKey::caching(Arc::new(r2));
        assert_eq!(a, b);
    }

    #[test]
    fn processors_differentiate_equivalence() {
        let base = req("https://example.com/a.png");
        let mut with_processors = (*base).clone();
        with_processors.processors = ProcessorList::new(vec![]);
        let a = RequestKey::loading(base.clone());
        let b = RequestKey::loading(Arc::new(with_processors));
        // Both have empty processor lists here, so they're still equal;
        // this guards that construction doesn't panic and compares cleanly.
        assert_eq!(a, b);
    }
}
