use std::fmt;
use std::sync::Arc;

use crate::image::Image;

/// A pure, synchronous image transform run on the `processing` stage.
///
/// Implementations must be side-effect free with respect to the pipeline:
/// `apply` returning `None` is treated as a processing failure
/// (`PipelineError::ProcessingFailed`), not a "pass the image through
/// unchanged" signal.
pub trait Processor: Send + Sync {
    /// Human-readable name, used only for tracing.
    fn name(&self) -> &str;

    fn apply(&self, image: &Image) -> Option<Image>;

    /// Processors are compared by behaviour, not identity, so that two
    /// independently-constructed `Request`s asking for "resize to 100x100"
    /// are loading-equivalent. The default assumes no two distinct processor
    /// values are ever equal; implementations that are cheap value types
    /// (the common case) should override this to compare their parameters.
    fn equals(&self, other: &dyn Processor) -> bool {
        let _ = other;
        false
    }
}

/// An ordered chain of processors, applied left to right. Equality is
/// pairwise-semantic: two lists are equal if they have the same length and
/// each pair of processors at the same position `equals()` each other.
#[derive(Clone, Default)]
pub struct ProcessorList(Vec<Arc<dyn Processor>>);

impl ProcessorList {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self(processors)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.0.iter()
    }

    /// Runs every processor in order, short-circuiting on the first failure.
    pub fn apply(&self, image: Image) -> Option<Image> {
        let mut current = image;
        for processor in &self.0 {
            current = processor.apply(&current)?;
        }
        Some(current)
    }

    /// Processor names in order, for tracing spans.
    pub fn trace(&self) -> Vec<&str> {
        self.0.iter().map(|p| p.name()).collect()
    }
}

impl PartialEq for ProcessorList {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.equals(b.as_ref()))
    }
}

impl Eq for ProcessorList {}

impl fmt::Debug for ProcessorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProcessorList").field(&self.trace()).finish()
    }
}
