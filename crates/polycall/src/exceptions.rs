//! Structured error carriers.
//!
//! Guest failures never cross the loader boundary as host panics or foreign
//! unwinds: they are reified into an [`Exception`] describing what happened,
//! wrapped in a [`Throwable`] marker, and returned through the ordinary value
//! channel. Callers detect the error path by checking for
//! `ValueId::Throwable`.

use crate::{
    heap::Heap,
    value::Value,
};

/// A structured error raised by a guest runtime or by the boundary itself.
#[derive(Debug)]
pub struct Exception {
    /// Human-readable description.
    pub message: String,
    /// Short classifier, e.g. `"ValueError"`, `"TypeError"`, `"Cancelled"`.
    pub label: String,
    /// Numeric code; loader-specific except for the reserved values below.
    pub code: i64,
    /// Backtrace text captured by the raising backend, possibly empty.
    pub stacktrace: String,
    /// Arbitrary value attached by the backend (owned by the exception).
    pub attached: Option<Value>,
}

/// Reserved code delivered when a loader is destroyed with futures in flight.
pub const CANCELLED_CODE: i64 = -1;

/// Reserved label delivered when a loader is destroyed with futures in flight.
pub const CANCELLED_LABEL: &str = "Cancelled";

impl Exception {
    /// Creates an exception with no code, stacktrace, or attachment.
    #[must_use]
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            label: label.into(),
            code: 0,
            stacktrace: String::new(),
            attached: None,
        }
    }

    /// Sets the loader-specific numeric code.
    #[must_use]
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    /// Sets the captured backtrace text.
    #[must_use]
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = stacktrace.into();
        self
    }

    /// The synthetic rejection used to cancel futures orphaned by loader
    /// destruction.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(CANCELLED_LABEL, "loader destroyed with the future still pending").with_code(CANCELLED_CODE)
    }

    /// A boundary type error (argument could not be coerced to the signature
    /// slot, symbol used with the wrong shape, ...).
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Whether this is the cancellation rejection.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == CANCELLED_CODE && self.label == CANCELLED_LABEL
    }

    /// Discards this exception without reifying it, releasing the attached
    /// value if one exists. Paths that drop an exception on the floor must
    /// run through here.
    pub fn release(mut self, heap: &mut Heap) {
        if let Some(attached) = self.attached.take() {
            attached.drop_with_heap(heap);
        }
    }
}

/// Marks its payload as the result of a failed computation.
///
/// The inner value is usually an [`Exception`], but any value a backend
/// chooses to throw travels the same way.
pub struct Throwable {
    /// The thrown payload, owned by the throwable.
    pub inner: Value,
}

/// Allocates `exception` on the heap and wraps it in a throwable, returning
/// the throwable value ready to flow back through the call channel.
pub fn throwable_from(heap: &mut Heap, exception: Exception) -> Value {
    let exc = heap.new_exception(exception);
    heap.new_throwable(exc)
}
