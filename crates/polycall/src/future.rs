//! Pending asynchronous results and their settlement plumbing.
//!
//! The loader acts as the event loop: awaiting an asynchronous function
//! registers the produced future under a [`CallTicket`], and the loader's
//! `drive` hook later reports completions for those tickets. Settlement
//! stores the value in the future and fires at most one of the two waiter
//! callbacks, exactly once.

use ahash::AHashMap;

use crate::{
    heap::{Heap, HeapData, HeapId, drain_value},
    value::Value,
};

/// Correlates an in-flight asynchronous invocation with the completion the
/// loader's event loop will eventually deliver. Sequential integers; the
/// counter always increments so tickets stay unique across a loader's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CallTicket(u64);

impl CallTicket {
    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Callback fired when a future settles. Receives an owned copy of the
/// settled value and must release it (`drop_with_heap`) when done.
///
/// Callbacks run on the thread driving the loader's event loop and must not
/// capture counted heap references: the future does not know about them and
/// could not release them on cancellation.
pub type SettleFn = Box<dyn FnOnce(&mut Heap, Value) + Send + Sync>;

/// Settlement state of a future.
pub enum FutureState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

/// A pending asynchronous result with a single waiter callback chain.
pub struct Future {
    state: FutureState,
    on_resolve: Option<SettleFn>,
    on_reject: Option<SettleFn>,
}

impl Future {
    /// A pending future with no waiters attached.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: FutureState::Pending,
            on_resolve: None,
            on_reject: None,
        }
    }

    /// A pending future with waiter callbacks; exactly one of them fires when
    /// the future settles.
    #[must_use]
    pub fn with_callbacks(on_resolve: Option<SettleFn>, on_reject: Option<SettleFn>) -> Self {
        Self {
            state: FutureState::Pending,
            on_resolve,
            on_reject,
        }
    }

    /// An already-fulfilled future (produced by awaiting a synchronous
    /// function).
    #[must_use]
    pub fn fulfilled(value: Value) -> Self {
        Self {
            state: FutureState::Fulfilled(value),
            on_resolve: None,
            on_reject: None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, FutureState::Pending)
    }

    #[must_use]
    pub fn state_name(&self) -> &'static str {
        match self.state {
            FutureState::Pending => "Pending",
            FutureState::Fulfilled(_) => "Fulfilled",
            FutureState::Rejected(_) => "Rejected",
        }
    }

    pub(crate) fn collect_child_ids(&mut self, out: &mut Vec<HeapId>) {
        let state = std::mem::replace(&mut self.state, FutureState::Pending);
        match state {
            FutureState::Pending => {}
            FutureState::Fulfilled(v) | FutureState::Rejected(v) => drain_value(v, out),
        }
        // Unfired callbacks are dropped without running.
        self.on_resolve = None;
        self.on_reject = None;
    }
}

/// Settles the future at `future_id` with `result` (`Ok` fulfills, `Err`
/// rejects), firing the matching waiter callback with an owned copy of the
/// settled value. Returns `false` (and releases `result`) when the future was
/// already settled or the id does not hold a future.
pub fn settle(heap: &mut Heap, future_id: HeapId, result: Result<Value, Value>) -> bool {
    heap.with_entry_mut(future_id, |heap, data| {
        let HeapData::Future(future) = data else {
            let (Ok(v) | Err(v)) = result;
            v.drop_with_heap(heap);
            return false;
        };
        if !future.is_pending() {
            let (Ok(v) | Err(v)) = result;
            v.drop_with_heap(heap);
            return false;
        }
        let (callback, value) = match result {
            Ok(v) => {
                let copy = v.clone_with_heap(heap);
                future.state = FutureState::Fulfilled(v);
                future.on_reject = None;
                (future.on_resolve.take(), copy)
            }
            Err(v) => {
                let copy = v.clone_with_heap(heap);
                future.state = FutureState::Rejected(v);
                future.on_resolve = None;
                (future.on_reject.take(), copy)
            }
        };
        if let Some(callback) = callback {
            callback(heap, value);
        } else {
            value.drop_with_heap(heap);
        }
        true
    })
}

/// Returns an owned copy of the settled value (`Ok` for fulfilled, `Err` for
/// rejected), or `None` while the future is still pending.
#[must_use]
pub fn settled_result(heap: &Heap, future_id: HeapId) -> Option<Result<Value, Value>> {
    match heap.get(future_id) {
        HeapData::Future(future) => match &future.state {
            FutureState::Pending => None,
            FutureState::Fulfilled(v) => Some(Ok(v.clone_with_heap(heap))),
            FutureState::Rejected(v) => Some(Err(v.clone_with_heap(heap))),
        },
        _ => None,
    }
}

/// Per-loader table of futures whose completions the event loop still owes.
///
/// The table holds one counted reference per registered future so a future
/// outlives a caller who discards the value returned by `await`; the
/// reference is released when the completion arrives or the loader dies.
#[derive(Default)]
pub struct PendingFutures {
    next: u64,
    inflight: AHashMap<u64, HeapId>,
}

impl PendingFutures {
    /// Allocates the next correlation ticket.
    pub fn allocate(&mut self) -> CallTicket {
        let ticket = CallTicket(self.next);
        self.next += 1;
        ticket
    }

    /// Registers a future under `ticket`, taking a counted reference.
    pub fn register(&mut self, heap: &Heap, ticket: CallTicket, future_id: HeapId) {
        heap.inc_ref(future_id);
        self.inflight.insert(ticket.0, future_id);
    }

    /// Removes the future registered under `ticket`. The caller settles it
    /// and must release the returned reference afterwards.
    pub fn complete(&mut self, ticket: CallTicket) -> Option<HeapId> {
        self.inflight.remove(&ticket.0)
    }

    /// Empties the table for cancellation. The caller rejects each returned
    /// future and releases its reference.
    pub fn drain(&mut self) -> Vec<HeapId> {
        self.inflight.drain().map(|(_, id)| id).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn settle_fires_resolve_exactly_once() {
        let mut heap = Heap::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let future = Future::with_callbacks(
            Some(Box::new(move |heap, value| {
                assert_eq!(value.as_int(), Some(7));
                seen.fetch_add(1, Ordering::SeqCst);
                value.drop_with_heap(heap);
            })),
            Some(Box::new(|heap, value| {
                value.drop_with_heap(heap);
                panic!("reject must not fire on fulfillment");
            })),
        );
        let v = heap.new_future(future);
        let id = v.ref_id().unwrap();
        assert!(settle(&mut heap, id, Ok(Value::Int(7))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // A second settlement is ignored and its value released.
        assert!(!settle(&mut heap, id, Ok(Value::Int(8))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        v.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn settled_result_copies_the_stored_value() {
        let mut heap = Heap::new();
        let v = heap.new_future(Future::pending());
        let id = v.ref_id().unwrap();
        assert!(settled_result(&heap, id).is_none());
        let payload = heap.new_string("done");
        assert!(settle(&mut heap, id, Ok(payload)));
        let copy = settled_result(&heap, id).unwrap().unwrap();
        assert_eq!(copy.as_str(&heap), Some("done"));
        copy.drop_with_heap(&mut heap);
        v.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn pending_table_keeps_futures_alive() {
        let mut heap = Heap::new();
        let mut pending = PendingFutures::default();
        let v = heap.new_future(Future::pending());
        let id = v.ref_id().unwrap();
        let ticket = pending.allocate();
        pending.register(&heap, ticket, id);
        // Caller discards its reference; the table's share keeps the slot.
        v.drop_with_heap(&mut heap);
        assert!(heap.get_if_live(id).is_some());
        let recovered = pending.complete(ticket).unwrap();
        assert_eq!(recovered, id);
        heap.dec_ref(recovered);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn tickets_stay_unique() {
        let mut pending = PendingFutures::default();
        let a = pending.allocate();
        let b = pending.allocate();
        assert_ne!(a, b);
        assert_eq!(b.raw(), a.raw() + 1);
    }
}
