//! Callable entities and the invocation/await contract.
//!
//! A [`Function`] pairs a signature with a backend trait object supplied by
//! the loader that discovered it. Synchronous invocation goes straight
//! through the backend; asynchronous invocation produces a [`Future`] value
//! whose completion the loader's event loop delivers under a [`CallTicket`].

use crate::{
    exceptions::Exception,
    future::{CallTicket, Future, PendingFutures, SettleFn, settle},
    heap::{Heap, HeapData, HeapId},
    signature::Signature,
    value::Value,
};

/// How an asynchronous invocation started.
pub enum AsyncStart {
    /// The result is already available; the future settles immediately.
    Ready(Result<Value, Exception>),
    /// The loader's event loop will deliver a completion for the ticket the
    /// core passed in.
    Scheduled,
}

/// Backend behavior of one callable, implemented per loader.
///
/// Backends receive the heap so they can allocate result values and must
/// release every argument they consume. They never unwind: guest failures
/// come back as `Err(Exception)`. The `Sync` bound exists because entities
/// live in the shared heap behind the runtime's reader-writer lock; use
/// interior locking for backend state that mutates.
pub trait FunctionBackend: Send + Sync {
    /// Synchronous invocation.
    fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, Exception>;

    /// Begins an asynchronous invocation correlated by `ticket`.
    ///
    /// The default runs the synchronous path immediately, which is the
    /// correct behavior for backends without an event loop.
    fn invoke_async(&self, heap: &mut Heap, args: Vec<Value>, ticket: CallTicket) -> AsyncStart {
        let _ = ticket;
        AsyncStart::Ready(self.invoke(heap, args))
    }

    /// Reports counted heap references held by backend state so they join
    /// the recursive release when the function dies.
    fn collect_refs(&mut self, out: &mut Vec<HeapId>) {
        let _ = out;
    }
}

/// A named callable with a signature and a sync/async flavor.
pub struct Function {
    name: Box<str>,
    signature: Signature,
    asynchronous: bool,
    /// Variadic functions bypass the `Invalid`-slot refusal and receive
    /// arguments uncoerced.
    variadic: bool,
    /// Tag of the loader that discovered this function (weak, by name).
    /// Awaits route through that loader's event loop.
    origin: Option<Box<str>>,
    backend: Box<dyn FunctionBackend>,
}

impl Function {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, signature: Signature, backend: Box<dyn FunctionBackend>) -> Self {
        Self {
            name: name.into(),
            signature,
            asynchronous: false,
            variadic: false,
            origin: None,
            backend,
        }
    }

    /// Marks the function asynchronous: direct invocation returns a future.
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Marks the function variadic.
    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn signature_mut(&mut self) -> &mut Signature {
        &mut self.signature
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    #[must_use]
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Stamps the loader tag this function was discovered by.
    #[must_use]
    pub fn with_origin(mut self, tag: impl Into<Box<str>>) -> Self {
        self.origin = Some(tag.into());
        self
    }

    /// The tag of the loader that discovered this function, if any.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub(crate) fn collect_child_ids(&mut self, out: &mut Vec<HeapId>) {
        self.backend.collect_refs(out);
    }
}

/// Releases every argument into the heap. Error paths run through here so
/// arguments never leak.
pub(crate) fn release_args(heap: &mut Heap, args: Vec<Value>) {
    for arg in args {
        arg.drop_with_heap(heap);
    }
}

/// Invokes the function at `fun_id` synchronously, transferring ownership of
/// `args` to the backend.
pub fn invoke(heap: &mut Heap, fun_id: HeapId, args: Vec<Value>) -> Result<Value, Exception> {
    heap.with_entry_mut(fun_id, |heap, data| {
        let HeapData::Function(fun) = data else {
            release_args(heap, args);
            return Err(Exception::type_error("invoke target is not a function"));
        };
        fun.backend.invoke(heap, args)
    })
}

/// Awaits the function at `fun_id`: returns a future value immediately and
/// arranges for exactly one of the callbacks to fire when it settles.
///
/// Awaiting a synchronous function produces an already-settled future (the
/// callback fires before this returns). Awaiting an asynchronous function
/// registers the future in `pending` under a fresh ticket unless the backend
/// reports the result ready.
pub fn await_with(
    heap: &mut Heap,
    fun_id: HeapId,
    args: Vec<Value>,
    on_resolve: Option<SettleFn>,
    on_reject: Option<SettleFn>,
    pending: &mut PendingFutures,
) -> Value {
    let asynchronous = matches!(heap.get(fun_id), HeapData::Function(f) if f.is_async());
    let future = heap.new_future(Future::with_callbacks(on_resolve, on_reject));
    let future_id = future.ref_id().expect("freshly allocated future");

    if asynchronous {
        let ticket = pending.allocate();
        let start = heap.with_entry_mut(fun_id, |heap, data| {
            let HeapData::Function(fun) = data else {
                release_args(heap, args);
                return AsyncStart::Ready(Err(Exception::type_error("await target is not a function")));
            };
            fun.backend.invoke_async(heap, args, ticket)
        });
        match start {
            AsyncStart::Ready(result) => settle_with_result(heap, future_id, result),
            AsyncStart::Scheduled => pending.register(heap, ticket, future_id),
        }
    } else {
        let result = invoke(heap, fun_id, args);
        settle_with_result(heap, future_id, result);
    }
    future
}

/// Settles `future_id` from a backend call result, reifying exceptions into
/// throwable values on the reject path.
pub(crate) fn settle_with_result(heap: &mut Heap, future_id: HeapId, result: Result<Value, Exception>) {
    let settled = match result {
        Ok(value) => Ok(value),
        Err(exception) => Err(crate::exceptions::throwable_from(heap, exception)),
    };
    settle(heap, future_id, settled);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueId;

    /// Sums integer arguments; the stock closure backend for tests.
    struct SumBackend;

    impl FunctionBackend for SumBackend {
        fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, Exception> {
            let mut total = 0i64;
            let mut error = None;
            for arg in &args {
                match arg {
                    Value::Int(i) => total += i64::from(*i),
                    Value::Long(l) => total += *l,
                    other => {
                        error = Some(Exception::type_error(format!("cannot sum a {}", other.value_id(heap))));
                        break;
                    }
                }
            }
            release_args(heap, args);
            match error {
                Some(exception) => Err(exception),
                None => Ok(Value::Long(total)),
            }
        }
    }

    fn sum_function(heap: &mut Heap) -> Value {
        heap.new_function(Function::new("sum", Signature::with_arity(2), Box::new(SumBackend)))
    }

    #[test]
    fn invoke_runs_the_backend() {
        let mut heap = Heap::new();
        let f = sum_function(&mut heap);
        let result = invoke(&mut heap, f.ref_id().unwrap(), vec![Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(result.as_long(), Some(5));
        f.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn invoke_surfaces_guest_exceptions() {
        let mut heap = Heap::new();
        let f = sum_function(&mut heap);
        let arg = heap.new_string("not a number");
        let err = invoke(&mut heap, f.ref_id().unwrap(), vec![arg]).unwrap_err();
        assert_eq!(err.label, "TypeError");
        f.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0, "failed call must release its arguments");
    }

    #[test]
    fn awaiting_a_sync_function_yields_a_fulfilled_future() {
        let mut heap = Heap::new();
        let mut pending = PendingFutures::default();
        let f = sum_function(&mut heap);
        let future = await_with(
            &mut heap,
            f.ref_id().unwrap(),
            vec![Value::Int(1), Value::Int(2)],
            None,
            None,
            &mut pending,
        );
        assert_eq!(future.value_id(&heap), ValueId::Future);
        assert!(pending.is_empty(), "sync awaits settle without an event loop");
        let settled = crate::future::settled_result(&heap, future.ref_id().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(settled.as_long(), Some(3));
        settled.drop_with_heap(&mut heap);
        future.drop_with_heap(&mut heap);
        f.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn variadic_and_async_flags_round_trip() {
        let fun = Function::new("f", Signature::new(), Box::new(SumBackend)).asynchronous().variadic();
        assert!(fun.is_async());
        assert!(fun.is_variadic());
        assert_eq!(fun.name(), "f");
    }
}
