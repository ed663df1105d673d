//! Structured runtime tracing.
//!
//! The core never writes to a log sink directly: it emits [`TraceEvent`]s
//! through a [`RuntimeTracer`] chosen by the embedder. Sinks may be called
//! from any thread and serialize internally.

use std::sync::Mutex;

/// One structured runtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A loader backend finished initializing.
    LoaderInitialized { tag: String },
    /// A search path was added to a loader.
    ExecutionPathAdded { tag: String, path: String },
    /// A handle was loaded and discovered.
    HandleLoaded { tag: String, handle: String, symbols: usize },
    /// A handle was cleared.
    HandleCleared { tag: String, handle: String },
    /// The dispatcher began a call.
    CallBegin { target: String },
    /// The dispatcher finished a call. `ok` is false when the result was a
    /// throwable or a fatal error.
    CallEnd { target: String, ok: bool },
    /// A future settled through a loader's event loop.
    FutureSettled { tag: String, fulfilled: bool },
    /// Outstanding futures were rejected because their loader died.
    FuturesCancelled { tag: String, count: usize },
    /// A loader was destroyed.
    LoaderDestroyed { tag: String },
    /// The whole runtime was torn down.
    RuntimeDestroyed,
    /// A fatal error was recorded.
    Error { message: String },
}

/// Receives structured events from the runtime. Implementations must be
/// callable from any thread.
pub trait RuntimeTracer: Send + Sync {
    fn event(&self, event: &TraceEvent);
}

/// Discards every event. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl RuntimeTracer for NoopTracer {
    fn event(&self, _event: &TraceEvent) {}
}

/// Writes one timestamped line per event to stderr. Lines are serialized so
/// concurrent loaders do not interleave output.
#[derive(Debug, Default)]
pub struct StderrTracer {
    gate: Mutex<()>,
}

impl RuntimeTracer for StderrTracer {
    fn event(&self, event: &TraceEvent) {
        let _guard = self.gate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        eprintln!("[{now}] {event:?}");
    }
}

/// Buffers events in memory for inspection; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything recorded so far.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RuntimeTracer for RecordingTracer {
    fn event(&self, event: &TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_tracer_buffers_in_order() {
        let tracer = RecordingTracer::new();
        tracer.event(&TraceEvent::LoaderInitialized { tag: "mock".into() });
        tracer.event(&TraceEvent::RuntimeDestroyed);
        let events = tracer.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TraceEvent::LoaderInitialized { tag: "mock".into() });
        assert!(tracer.is_empty());
    }

    #[test]
    fn recording_tracer_accepts_events_from_any_thread() {
        let tracer = std::sync::Arc::new(RecordingTracer::new());
        let clone = std::sync::Arc::clone(&tracer);
        std::thread::spawn(move || {
            clone.event(&TraceEvent::CallBegin { target: "f".into() });
        })
        .join()
        .unwrap();
        assert_eq!(tracer.len(), 1);
    }
}
