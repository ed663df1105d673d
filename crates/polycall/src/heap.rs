//! Reference-counted arena holding every heap-backed value payload.
//!
//! Slots are `Vec<Option<..>>` entries addressed by [`HeapId`]; freed slots
//! are recycled through a free list. Reference counts are atomic so that
//! `inc_ref` only needs shared access (this avoids borrow conflicts during
//! lookups that must keep entities alive while reading them).
//!
//! Ownership is a tree: releasing the last reference to a composite releases
//! its children before the slot itself is recycled. The ownership tree must
//! not contain cycles; entities that need to refer back to their owner do so
//! by name, never by a counted reference.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering, fence},
};

use crate::{
    exceptions::{Exception, Throwable},
    function::Function,
    future::Future,
    klass::{Class, Instance},
    value::{Value, ValueId},
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Heap-allocated payload kinds.
///
/// `Str`/`Buffer`/`Array`/`Map` are plain data owned by the slot. The
/// remaining variants are reflection entities whose behavior lives behind
/// backend trait objects supplied by loaders.
pub enum HeapData {
    Str(String),
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    /// Insertion-ordered sequence of key/value pairs. Keys may be any value;
    /// the serial bridge decides between object and pair-array encodings.
    Map(Vec<(Value, Value)>),
    Function(Function),
    Class(Class),
    Object(Instance),
    Exception(Exception),
    Throwable(Throwable),
    Future(Future),
}

impl std::fmt::Debug for HeapData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            Self::Function(fun) => f.debug_tuple("Function").field(&fun.name()).finish(),
            Self::Class(cls) => f.debug_tuple("Class").field(&cls.name()).finish(),
            Self::Object(obj) => f.debug_tuple("Object").field(&obj.name()).finish(),
            Self::Exception(e) => f.debug_tuple("Exception").field(&e.label).finish(),
            Self::Throwable(t) => f.debug_tuple("Throwable").field(&t.inner).finish(),
            Self::Future(fut) => f.debug_tuple("Future").field(&fut.state_name()).finish(),
        }
    }
}

impl HeapData {
    /// The value sort this payload reports through `Value::value_id`.
    #[must_use]
    pub fn value_id(&self) -> ValueId {
        match self {
            Self::Str(_) => ValueId::String,
            Self::Buffer(_) => ValueId::Buffer,
            Self::Array(_) => ValueId::Array,
            Self::Map(_) => ValueId::Map,
            Self::Function(_) => ValueId::Function,
            Self::Class(_) => ValueId::Class,
            Self::Object(_) => ValueId::Object,
            Self::Exception(_) => ValueId::Exception,
            Self::Throwable(_) => ValueId::Throwable,
            Self::Future(_) => ValueId::Future,
        }
    }

    /// Static name of the payload kind, used for heap statistics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Buffer(_) => "Buffer",
            Self::Array(_) => "Array",
            Self::Map(_) => "Map",
            Self::Function(_) => "Function",
            Self::Class(_) => "Class",
            Self::Object(_) => "Object",
            Self::Exception(_) => "Exception",
            Self::Throwable(_) => "Throwable",
            Self::Future(_) => "Future",
        }
    }

    /// Moves every owned child reference out of this payload into `out`,
    /// neutralizing the `Value` wrappers so the `ref-count-panic` guard does
    /// not fire when the payload itself is dropped.
    fn collect_child_ids(&mut self, out: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Buffer(_) => {}
            Self::Array(items) => {
                for item in items.drain(..) {
                    drain_value(item, out);
                }
            }
            Self::Map(pairs) => {
                for (key, value) in pairs.drain(..) {
                    drain_value(key, out);
                    drain_value(value, out);
                }
            }
            Self::Function(fun) => fun.collect_child_ids(out),
            Self::Class(cls) => cls.collect_child_ids(out),
            Self::Object(obj) => obj.collect_child_ids(out),
            Self::Exception(e) => {
                if let Some(attached) = e.attached.take() {
                    drain_value(attached, out);
                }
            }
            Self::Throwable(t) => {
                let inner = std::mem::replace(&mut t.inner, Value::Null);
                drain_value(inner, out);
            }
            Self::Future(fut) => fut.collect_child_ids(out),
        }
    }
}

/// Records the heap id (if any) of `value` and forgets the wrapper without
/// running its Drop guard. Used while dismantling a payload whose children
/// are about to be released by the arena itself.
pub(crate) fn drain_value(value: Value, out: &mut Vec<HeapId>) {
    if let Value::Ref(id) = &value {
        out.push(*id);
    }
    std::mem::forget(value);
}

struct HeapEntry {
    refcount: AtomicUsize,
    /// `None` while the payload is detached by `with_entry_mut`.
    data: Option<HeapData>,
}

/// Snapshot of heap state at a point in time.
///
/// `objects_by_kind` uses `BTreeMap` for deterministic iteration order, so
/// snapshots are directly comparable and displayable. The leak-detection
/// tests assert `live_objects == 0` after balanced workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by payload kind name.
    pub objects_by_kind: BTreeMap<&'static str, usize>,
}

/// The arena. See the module docs for the ownership rules.
#[derive(Default)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`,
    /// consumed by `alloc`.
    free_list: Vec<HeapId>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    /// Allocates a new slot with refcount 1 and returns its id.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let entry = HeapEntry {
            refcount: AtomicUsize::new(1),
            data: Some(data),
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// Uses interior mutability for the refcount, so only shared access to
    /// the heap is required.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count and frees the entry (plus children)
    /// once it hits zero. Freed slot ids go on the free list for reuse.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let entry = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_ref().expect("Heap::dec_ref: object already freed");
            if entry.refcount.fetch_sub(1, Ordering::Release) > 1 {
                return;
            }
            // Last reference: synchronize with every prior release before
            // running the destructor.
            fence(Ordering::Acquire);
            slot.take().expect("Heap::dec_ref: object already freed")
        };
        self.free_list.push(id);
        if let Some(mut data) = entry.data {
            let mut child_ids = Vec::new();
            data.collect_child_ids(&mut child_ids);
            drop(data);
            for child in child_ids {
                self.dec_ref(child);
            }
        }
    }

    /// Returns an immutable reference to the payload stored at `id`.
    ///
    /// # Panics
    /// Panics if the id is invalid, the entry has been freed, or the payload
    /// is currently detached by `with_entry_mut`.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
            .as_ref()
            .expect("Heap::get: data currently borrowed")
    }

    /// Returns the payload if the slot is live, `None` otherwise.
    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref()?.data.as_ref()
    }

    /// Returns a mutable reference to the payload stored at `id`.
    ///
    /// # Panics
    /// Same conditions as [`Heap::get`].
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: data currently borrowed")
    }

    /// Temporarily detaches the payload at `id`, allowing the closure to
    /// operate on it while also mutating the rest of the heap (allocating
    /// results, releasing arguments). Backend invocations run through here.
    ///
    /// The caller must hold a reference to `id` across the call. If the
    /// last reference is nonetheless dropped while the payload is detached,
    /// the deferred child release is completed on the way out.
    ///
    /// # Panics
    /// Panics on re-entrant detachment of the same id.
    pub fn with_entry_mut<R>(&mut self, id: HeapId, f: impl FnOnce(&mut Self, &mut HeapData) -> R) -> R {
        let mut data = self
            .entries
            .get_mut(id.index())
            .expect("Heap::with_entry_mut: slot missing")
            .as_mut()
            .expect("Heap::with_entry_mut: object already freed")
            .data
            .take()
            .expect("Heap::with_entry_mut: data currently borrowed");
        let out = f(self, &mut data);
        match self.entries.get_mut(id.index()).and_then(Option::as_mut) {
            Some(entry) => entry.data = Some(data),
            None => {
                // The slot died while detached: finish the recursive release
                // that dec_ref had to skip.
                let mut child_ids = Vec::new();
                data.collect_child_ids(&mut child_ids);
                drop(data);
                for child in child_ids {
                    self.dec_ref(child);
                }
            }
        }
        out
    }

    /// Current refcount of a live entry, or 0 when freed.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount.load(Ordering::Relaxed))
    }

    /// Captures heap occupancy for monitoring and leak detection.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live_objects = 0;
        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            let kind = entry.data.as_ref().map_or("<borrowed>", HeapData::kind_name);
            *objects_by_kind.entry(kind).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_kind,
        }
    }

    /// Iterates the ids of all live entries. Used by teardown sweeps.
    pub fn live_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| HeapId(index))
    }

    pub fn new_string(&mut self, s: impl Into<String>) -> Value {
        Value::Ref(self.alloc(HeapData::Str(s.into())))
    }

    pub fn new_buffer(&mut self, bytes: Vec<u8>) -> Value {
        Value::Ref(self.alloc(HeapData::Buffer(bytes)))
    }

    /// Wraps `items` into an array value, taking ownership of every element.
    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.alloc(HeapData::Array(items)))
    }

    /// Wraps `pairs` into a map value, taking ownership of keys and values.
    pub fn new_map(&mut self, pairs: Vec<(Value, Value)>) -> Value {
        Value::Ref(self.alloc(HeapData::Map(pairs)))
    }

    pub fn new_exception(&mut self, exception: Exception) -> Value {
        Value::Ref(self.alloc(HeapData::Exception(exception)))
    }

    /// Wraps `inner` (ownership transferred) into a throwable marker value.
    pub fn new_throwable(&mut self, inner: Value) -> Value {
        Value::Ref(self.alloc(HeapData::Throwable(Throwable { inner })))
    }

    pub fn new_function(&mut self, function: Function) -> Value {
        Value::Ref(self.alloc(HeapData::Function(function)))
    }

    pub fn new_class(&mut self, class: Class) -> Value {
        Value::Ref(self.alloc(HeapData::Class(class)))
    }

    pub fn new_future(&mut self, future: Future) -> Value {
        Value::Ref(self.alloc(HeapData::Future(future)))
    }
}
