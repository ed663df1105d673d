//! The process-wide loader directory.
//!
//! Loaders are stored in initialization order; teardown walks them in
//! reverse, and for each loader every handle and context is released (and
//! every pending future cancelled) strictly before the backend itself is
//! destroyed.

use indexmap::IndexMap;

use crate::{
    heap::Heap,
    loader::LoaderImpl,
    tracer::{RuntimeTracer, TraceEvent},
};

/// Directory of live loaders keyed by language tag.
#[derive(Default)]
pub struct Registry {
    loaders: IndexMap<String, LoaderImpl>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.loaders.contains_key(tag)
    }

    /// Records an initialized loader. Insertion order is initialization
    /// order and governs both symbol resolution and teardown.
    pub fn insert(&mut self, loader: LoaderImpl) {
        self.loaders.insert(loader.tag().to_string(), loader);
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&LoaderImpl> {
        self.loaders.get(tag)
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut LoaderImpl> {
        self.loaders.get_mut(tag)
    }

    /// Iterates loaders in initialization order.
    pub fn iter(&self) -> impl Iterator<Item = &LoaderImpl> {
        self.loaders.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LoaderImpl> {
        self.loaders.values_mut()
    }

    /// Tags in initialization order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Destroys one loader, removing it from the directory. Handles,
    /// contexts, and futures go first; the backend last.
    pub fn destroy_loader(&mut self, tag: &str, heap: &mut Heap, tracer: &dyn RuntimeTracer) -> bool {
        let Some(mut loader) = self.loaders.shift_remove(tag) else {
            return false;
        };
        let cancelled = loader.cancel_pending(heap);
        if cancelled > 0 {
            tracer.event(&TraceEvent::FuturesCancelled {
                tag: tag.to_string(),
                count: cancelled,
            });
        }
        if let Err(err) = loader.destroy(heap) {
            tracer.event(&TraceEvent::Error {
                message: format!("loader {tag:?} destroy failed: {err}"),
            });
        }
        tracer.event(&TraceEvent::LoaderDestroyed { tag: tag.to_string() });
        true
    }

    /// Destroys every loader in reverse initialization order.
    pub fn destroy_all(&mut self, heap: &mut Heap, tracer: &dyn RuntimeTracer) {
        while let Some((tag, mut loader)) = self.loaders.pop() {
            let cancelled = loader.cancel_pending(heap);
            if cancelled > 0 {
                tracer.event(&TraceEvent::FuturesCancelled {
                    tag: tag.clone(),
                    count: cancelled,
                });
            }
            if let Err(err) = loader.destroy(heap) {
                tracer.event(&TraceEvent::Error {
                    message: format!("loader {tag:?} destroy failed: {err}"),
                });
            }
            tracer.event(&TraceEvent::LoaderDestroyed { tag });
        }
    }
}
