//! The public dispatcher: load / invoke / await / introspect / destroy.
//!
//! [`Runtime`] is the single process-wide struct. It owns the heap, the
//! loader registry, the serial registry, and the configuration behind one
//! reader-writer lock, and a tracer chosen at initialization. Entry points
//! that target a thread-confined loader from a foreign thread are packaged
//! onto that loader's FIFO queue and executed when the owning thread next
//! enters; everything else locks and runs in place.
//!
//! Error discipline: guest failures come back as `Throwable` boundary
//! values through `Ok(..)`; fatal conditions (unknown tag or symbol, init
//! failure) come back as `Err(..)` and additionally record a thread-local
//! message readable via [`crate::error::last_error`].

use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    config::Configuration,
    error::{DispatchError, DispatchResult, LoadError, clear_last_error, set_last_error},
    exceptions::Exception,
    function,
    future::{PendingFutures, SettleFn, settled_result},
    heap::{Heap, HeapData, HeapId, HeapStats},
    host::{self, ClassRef, FunctionRef, FutureRef, HostValue, ObjectRef},
    inspect, klass,
    loader::{HandleRef, LoadSource, LoaderBackend, LoaderImpl},
    loaders::mock::MockLoader,
    registry::Registry,
    serial::SerialRegistry,
    task_queue::{TaskQueue, TaskSlot},
    tracer::{NoopTracer, RuntimeTracer, TraceEvent},
    types::Type,
    value::{Value, ValueId},
};

/// Produces a fresh backend instance for a tag on first use.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn LoaderBackend> + Send + Sync>;

/// Callback receiving the settled value of an awaited call. The value owns
/// its entity references; hand it to [`Runtime::release`] after the driving
/// call returns. Runtime methods must not be called from inside the
/// callback itself.
pub type HostCallback = Box<dyn FnOnce(HostValue) + Send + Sync>;

struct Gate {
    owner: std::thread::ThreadId,
    queue: TaskQueue<RuntimeState>,
}

pub(crate) struct RuntimeState {
    heap: Heap,
    registry: Registry,
    serials: SerialRegistry,
    factories: IndexMap<String, BackendFactory>,
    config: Configuration,
    /// Futures of functions with no recorded origin loader; cancelled at
    /// runtime teardown.
    orphan_pending: PendingFutures,
    destroyed: bool,
}

/// How a call-site name resolved.
enum Resolved {
    /// A symbol bound in some handle's scope.
    Symbol { tag: String, id: HeapId },
    /// `qualifier.member` where the qualifier resolved to a class or
    /// object; the member is invoked on it.
    Member { tag: String, owner: HeapId, member: String },
}

/// The process-wide runtime.
pub struct Runtime {
    state: RwLock<RuntimeState>,
    gates: Mutex<AHashMap<String, Arc<Gate>>>,
    tracer: Arc<dyn RuntimeTracer>,
}

impl Runtime {
    /// Brings the runtime up with configuration from the environment, the
    /// silent tracer, and the mock loader registered.
    #[must_use]
    pub fn initialize() -> Self {
        Self::initialize_with(Configuration::from_env(), Arc::new(NoopTracer))
    }

    /// Brings the runtime up with explicit configuration and tracer.
    #[must_use]
    pub fn initialize_with(config: Configuration, tracer: Arc<dyn RuntimeTracer>) -> Self {
        clear_last_error();
        let mut factories: IndexMap<String, BackendFactory> = IndexMap::new();
        factories.insert(
            MockLoader::TAG.to_string(),
            Box::new(|| Box::new(MockLoader::new()) as Box<dyn LoaderBackend>),
        );
        let state = RuntimeState {
            heap: Heap::new(),
            registry: Registry::new(),
            serials: SerialRegistry::with_builtin(),
            factories,
            config,
            orphan_pending: PendingFutures::default(),
            destroyed: false,
        };
        Self {
            state: RwLock::new(state),
            gates: Mutex::new(AHashMap::new()),
            tracer,
        }
    }

    /// Registers a loader backend factory under `tag`. The backend is
    /// instantiated and initialized on first use.
    pub fn register_loader(&self, tag: &str, factory: BackendFactory) {
        let mut state = self.write_state();
        state.factories.insert(tag.to_string(), factory);
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RuntimeState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RuntimeState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Locks the state and runs `job` on the current thread, draining any
    /// confined-loader queues this thread owns first. Operations that do
    /// not target a specific loader come through here.
    fn with_state<R>(&self, job: impl FnOnce(&mut RuntimeState, &dyn RuntimeTracer) -> R) -> R {
        let mut state = self.write_state();
        self.drain_owned_gates(&mut state);
        job(&mut state, self.tracer.as_ref())
    }

    /// The gate for `tag` when that loader is thread-confined, creating it
    /// on first sight.
    fn confinement_gate(&self, tag: &str) -> Option<Arc<Gate>> {
        let owner = {
            let state = self.read_state();
            state.registry.get(tag)?.confined_to()?
        };
        let mut gates = self.gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(Arc::clone(gates.entry(tag.to_string()).or_insert_with(|| {
            Arc::new(Gate {
                owner,
                queue: TaskQueue::new(),
            })
        })))
    }

    /// Runs every queued task for gates owned by the current thread.
    fn drain_owned_gates(&self, state: &mut RuntimeState) {
        let me = std::thread::current().id();
        let owned: Vec<Arc<Gate>> = {
            let gates = self.gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            gates.values().filter(|gate| gate.owner == me).map(Arc::clone).collect()
        };
        for gate in owned {
            gate.queue.drain(state);
        }
    }

    /// Entry-point funnel for operations that mutate one loader. When that
    /// loader is thread-confined and the current thread is not its owner,
    /// the job is queued FIFO and executed the next time the owning thread
    /// enters the loader; the caller blocks on the result meanwhile.
    fn enter<R, F>(&self, tag: Option<&str>, job: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut RuntimeState, &dyn RuntimeTracer) -> R + Send + 'static,
    {
        if let Some(gate) = tag.and_then(|tag| self.confinement_gate(tag))
            && gate.owner != std::thread::current().id()
        {
            let slot = Arc::new(TaskSlot::new());
            let fill = Arc::clone(&slot);
            let tracer = Arc::clone(&self.tracer);
            gate.queue.push(Box::new(move |state| fill.fill(job(state, tracer.as_ref()))));
            return slot.wait();
        }
        self.with_state(job)
    }

    /// Records fatal errors in the thread-local slot on the way out.
    fn fatal<T>(result: DispatchResult<T>) -> DispatchResult<T> {
        if let Err(err) = &result {
            set_last_error(err.to_string());
        }
        result
    }

    // ---- load pipeline ----------------------------------------------------

    /// Adds a search path to a loader (initializing it on first use).
    pub fn execution_path(&self, tag: &str, path: impl Into<std::path::PathBuf>) -> DispatchResult<()> {
        let tag_owned = tag.to_string();
        let path = path.into();
        Self::fatal(self.enter(Some(tag), move |state, tracer| {
            state.check_alive()?;
            state.ensure_loader(&tag_owned, tracer)?;
            let loader = state.registry.get_mut(&tag_owned).expect("ensured above");
            loader.execution_path(&path).map_err(DispatchError::Load)?;
            tracer.event(&TraceEvent::ExecutionPathAdded {
                tag: tag_owned,
                path: path.display().to_string(),
            });
            Ok(())
        }))
    }

    /// Loads source files into a public handle.
    pub fn load_from_file(&self, tag: &str, paths: &[&str]) -> DispatchResult<()> {
        let source = LoadSource::File(paths.iter().map(std::path::PathBuf::from).collect());
        self.load(tag, source, true).map(|_| ())
    }

    /// Loads source files into a private, caller-held handle.
    pub fn load_from_file_handle(&self, tag: &str, paths: &[&str]) -> DispatchResult<HandleRef> {
        let source = LoadSource::File(paths.iter().map(std::path::PathBuf::from).collect());
        self.load(tag, source, false)
    }

    /// Loads in-memory source into a public handle named `name`.
    pub fn load_from_memory(&self, tag: &str, name: &str, buffer: &[u8]) -> DispatchResult<()> {
        let source = LoadSource::Memory {
            name: name.to_string(),
            buffer: buffer.to_vec(),
        };
        self.load(tag, source, true).map(|_| ())
    }

    /// Loads in-memory source into a private, caller-held handle.
    pub fn load_from_memory_handle(&self, tag: &str, name: &str, buffer: &[u8]) -> DispatchResult<HandleRef> {
        let source = LoadSource::Memory {
            name: name.to_string(),
            buffer: buffer.to_vec(),
        };
        self.load(tag, source, false)
    }

    /// Loads a compiled artifact into a public handle.
    pub fn load_from_package(&self, tag: &str, path: &str) -> DispatchResult<()> {
        self.load(tag, LoadSource::Package(path.into()), true).map(|_| ())
    }

    /// Loads a compiled artifact into a private, caller-held handle.
    pub fn load_from_package_handle(&self, tag: &str, path: &str) -> DispatchResult<HandleRef> {
        self.load(tag, LoadSource::Package(path.into()), false)
    }

    fn load(&self, tag: &str, source: LoadSource, public: bool) -> DispatchResult<HandleRef> {
        let tag_owned = tag.to_string();
        Self::fatal(self.enter(Some(tag), move |state, tracer| {
            state.check_alive()?;
            state.ensure_loader(&tag_owned, tracer)?;
            let RuntimeState { heap, registry, .. } = state;
            let loader = registry.get_mut(&tag_owned).expect("ensured above");
            let index = loader.load(heap, &source, public).map_err(DispatchError::Load)?;
            let handle = loader.handle(index).expect("just loaded");
            tracer.event(&TraceEvent::HandleLoaded {
                tag: tag_owned.clone(),
                handle: handle.name().to_string(),
                symbols: handle.context().root().len(),
            });
            Ok(HandleRef {
                tag: tag_owned,
                index,
            })
        }))
    }

    /// Unloads the handle behind `handle`, releasing its context.
    pub fn clear(&self, handle: &HandleRef) -> DispatchResult<()> {
        let tag = handle.tag.clone();
        let handle = handle.clone();
        Self::fatal(self.enter(Some(&tag), move |state, tracer| {
            state.check_alive()?;
            let RuntimeState { heap, registry, .. } = state;
            let loader = registry
                .get_mut(&handle.tag)
                .ok_or_else(|| DispatchError::Load(LoadError::LoaderNotFound(handle.tag.clone())))?;
            let name = loader.handle(handle.index).map(|h| h.name().to_string());
            loader.clear(heap, handle.index).map_err(DispatchError::Load)?;
            tracer.event(&TraceEvent::HandleCleared {
                tag: handle.tag.clone(),
                handle: name.unwrap_or_default(),
            });
            Ok(())
        }))
    }

    // ---- invocation -------------------------------------------------------

    /// Calls `name` with `args`. Names resolve as a bare symbol, as
    /// `handle.symbol`, or as `class_or_object.member`; symbol search walks
    /// loaders in initialization order and public handles in load order.
    /// Calling an asynchronous function transparently drives its loader's
    /// event loop to completion. Guest failures come back as throwables.
    pub fn call(&self, name: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let routing = self.routing_tag(name);
        let name_owned = name.to_string();
        Self::fatal(self.enter(routing.as_deref(), move |state, tracer| {
            state.check_alive()?;
            tracer.event(&TraceEvent::CallBegin {
                target: name_owned.clone(),
            });
            let result = state.call_by_name(&name_owned, args);
            let ok = matches!(&result, Ok(value) if !value.is_throwable());
            tracer.event(&TraceEvent::CallEnd {
                target: name_owned,
                ok,
            });
            result
        }))
    }

    /// Calls `symbol` inside the given handle only.
    pub fn call_with_handle(&self, handle: &HandleRef, symbol: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let tag = handle.tag.clone();
        let handle = handle.clone();
        let symbol = symbol.to_string();
        Self::fatal(self.enter(Some(&tag), move |state, tracer| {
            state.check_alive()?;
            tracer.event(&TraceEvent::CallBegin {
                target: format!("{}:{symbol}", handle.tag),
            });
            let result = state.call_in_handle(&handle, &symbol, args);
            let ok = matches!(&result, Ok(value) if !value.is_throwable());
            tracer.event(&TraceEvent::CallEnd {
                target: format!("{}:{symbol}", handle.tag),
                ok,
            });
            result
        }))
    }

    /// Calls directly through a function reference (no name resolution).
    pub fn call_function(&self, function: &FunctionRef, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let id = function.0;
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Function)?;
            state.invoke_function_value(id, args)
        }))
    }

    /// Begins an awaited call of `name`, returning the future immediately.
    /// Completion is delivered when the loader's event loop is driven (any
    /// runtime call pumps it, or use [`Runtime::wait`]).
    pub fn call_async(&self, name: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        self.call_async_inner(name, args, None, None)
    }

    /// Begins an awaited call with explicit settlement callbacks; exactly
    /// one fires, once, when the future settles.
    pub fn call_async_with(
        &self,
        name: &str,
        args: Vec<HostValue>,
        on_resolve: HostCallback,
        on_reject: HostCallback,
    ) -> DispatchResult<HostValue> {
        self.call_async_inner(name, args, Some(on_resolve), Some(on_reject))
    }

    fn call_async_inner(
        &self,
        name: &str,
        args: Vec<HostValue>,
        on_resolve: Option<HostCallback>,
        on_reject: Option<HostCallback>,
    ) -> DispatchResult<HostValue> {
        let routing = self.routing_tag(name);
        let name_owned = name.to_string();
        Self::fatal(self.enter(routing.as_deref(), move |state, _tracer| {
            state.check_alive()?;
            state.await_by_name(&name_owned, args, on_resolve.map(adapt_callback), on_reject.map(adapt_callback))
        }))
    }

    /// Blocks until the future settles, driving every loader's event loop,
    /// and returns the settled value (rejections come back as throwables).
    pub fn wait(&self, future: &FutureRef) -> DispatchResult<HostValue> {
        let id = future.0;
        Self::fatal(self.with_state(move |state, tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Future)?;
            let settled = state.drive_until_settled(id, None, tracer)?;
            let RuntimeState { heap, .. } = state;
            Ok(match settled {
                Ok(value) => host::outtake_owned(heap, value),
                Err(thrown) => host::outtake_owned(heap, thrown),
            })
        }))
    }

    /// Pumps one loader's event loop once; returns how many futures
    /// settled.
    pub fn drive(&self, tag: &str) -> DispatchResult<usize> {
        let tag_owned = tag.to_string();
        Self::fatal(self.enter(Some(tag), move |state, tracer| {
            state.check_alive()?;
            let RuntimeState { heap, registry, .. } = state;
            let loader = registry
                .get_mut(&tag_owned)
                .ok_or_else(|| DispatchError::Load(LoadError::LoaderNotFound(tag_owned.clone())))?;
            let settled = loader.pump(heap);
            for fulfilled in &settled {
                tracer.event(&TraceEvent::FutureSettled {
                    tag: tag_owned.clone(),
                    fulfilled: *fulfilled,
                });
            }
            Ok(settled.len())
        }))
    }

    // ---- classes and objects ----------------------------------------------

    /// Constructs an object of `class` with `args`, picking the constructor
    /// overload from the argument sorts.
    pub fn construct(&self, class: &ClassRef, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let id = class.0;
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Class)?;
            let RuntimeState { heap, .. } = state;
            let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
            let result = klass::class_new(heap, id, "", None, &values);
            function::release_args(heap, values);
            Ok(state.guest_result_to_host(result))
        }))
    }

    /// Invokes a method on `object`, resolving the overload from the
    /// argument sorts. Asynchronous methods are transparently awaited.
    pub fn call_method(&self, object: &ObjectRef, method: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let id = object.0;
        let method = method.to_string();
        Self::fatal(self.with_state(move |state, tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Object)?;
            state.invoke_object_method(id, &method, args, tracer)
        }))
    }

    /// Begins an awaited method call, returning the future immediately.
    pub fn await_method(&self, object: &ObjectRef, method: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let id = object.0;
        let method = method.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Object)?;
            let RuntimeState {
                heap,
                registry,
                orphan_pending,
                ..
            } = state;
            let origin = object_origin(heap, id);
            let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
            let pending = pending_for(registry, orphan_pending, origin.as_deref());
            match klass::object_await(heap, id, &method, values, None, None, pending) {
                Ok(future) => Ok(host::outtake_owned(heap, future)),
                Err(exception) => Ok(state.guest_result_to_host(Err(exception))),
            }
        }))
    }

    /// Reads an attribute of `object` under its class accessor mode.
    pub fn get_attribute(&self, object: &ObjectRef, attribute: &str) -> DispatchResult<HostValue> {
        let id = object.0;
        let attribute = attribute.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Object)?;
            let result = klass::object_get(&mut state.heap, id, &attribute);
            Ok(state.guest_result_to_host(result))
        }))
    }

    /// Writes an attribute of `object`. Returns `Null`, or a throwable when
    /// the guest refused the write.
    pub fn set_attribute(&self, object: &ObjectRef, attribute: &str, value: HostValue) -> DispatchResult<HostValue> {
        let id = object.0;
        let attribute = attribute.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Object)?;
            let intaken = host::intake(&mut state.heap, value);
            let result = klass::object_set(&mut state.heap, id, &attribute, intaken).map(|()| Value::Null);
            Ok(state.guest_result_to_host(result))
        }))
    }

    /// Reads a static attribute of `class`.
    pub fn static_get(&self, class: &ClassRef, attribute: &str) -> DispatchResult<HostValue> {
        let id = class.0;
        let attribute = attribute.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Class)?;
            let result = klass::class_static_get(&mut state.heap, id, &attribute);
            Ok(state.guest_result_to_host(result))
        }))
    }

    /// Writes a static attribute of `class`.
    pub fn static_set(&self, class: &ClassRef, attribute: &str, value: HostValue) -> DispatchResult<HostValue> {
        let id = class.0;
        let attribute = attribute.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Class)?;
            let intaken = host::intake(&mut state.heap, value);
            let result = klass::class_static_set(&mut state.heap, id, &attribute, intaken).map(|()| Value::Null);
            Ok(state.guest_result_to_host(result))
        }))
    }

    /// Invokes a static method of `class`.
    pub fn static_call(&self, class: &ClassRef, method: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let id = class.0;
        let method = method.to_string();
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            state.expect_kind(id, ValueId::Class)?;
            let RuntimeState { heap, .. } = state;
            let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
            let result = klass::class_static_call(heap, id, &method, values);
            Ok(state.guest_result_to_host(result))
        }))
    }

    // ---- introspection and serialization ----------------------------------

    /// Builds the introspection document for every loader and handle.
    pub fn inspect(&self) -> DispatchResult<inspect::InspectDocument> {
        Self::fatal(self.with_state(move |state, _tracer| {
            state.check_alive()?;
            Ok(inspect::document(&state.heap, &state.registry))
        }))
    }

    /// The introspection document as JSON text (the RPC wire form).
    pub fn inspect_json(&self) -> DispatchResult<String> {
        let doc = self.inspect()?;
        serde_json::to_string(&doc).map_err(|err| DispatchError::Serial(err.to_string()))
    }

    /// Encodes a boundary value through the named serial format. The value
    /// is only read; entity references stay owned by the caller.
    pub fn serialize(&self, format: &str, value: &HostValue) -> DispatchResult<Vec<u8>> {
        Self::fatal(self.with_state(|state, _tracer| {
            state.check_alive()?;
            let RuntimeState { heap, serials, .. } = state;
            let serial = serials
                .get(format)
                .ok_or_else(|| DispatchError::SerialNotFound(format.to_string()))?;
            let staged = host::intake_borrowed(heap, value);
            let bytes = serial
                .serialize(heap, &staged)
                .map_err(|err| DispatchError::Serial(err.to_string()));
            staged.drop_with_heap(heap);
            bytes
        }))
    }

    /// Decodes bytes through the named serial format into a boundary value.
    pub fn deserialize(&self, format: &str, bytes: &[u8]) -> DispatchResult<HostValue> {
        Self::fatal(self.with_state(|state, _tracer| {
            state.check_alive()?;
            let RuntimeState { heap, serials, .. } = state;
            let serial = serials
                .get(format)
                .ok_or_else(|| DispatchError::SerialNotFound(format.to_string()))?;
            let value = serial
                .deserialize(heap, bytes)
                .map_err(|err| DispatchError::Serial(err.to_string()))?;
            Ok(host::outtake_owned(heap, value))
        }))
    }

    /// Names of the registered serial formats.
    pub fn serials(&self) -> Vec<String> {
        self.read_state().serials.names().map(str::to_string).collect()
    }

    /// Tags of the currently initialized loaders, in initialization order.
    pub fn loader_tags(&self) -> Vec<String> {
        self.read_state().registry.tags().map(str::to_string).collect()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Releases a boundary value's entity references.
    pub fn release(&self, value: HostValue) {
        self.with_state(move |state, _tracer| {
            host::release(&mut state.heap, value);
        });
    }

    /// Current heap occupancy; `live_objects == 0` after balanced use.
    pub fn heap_stats(&self) -> HeapStats {
        self.read_state().heap.stats()
    }

    /// Whether the runtime is up: initialized and not yet destroyed. Every
    /// other entry point refuses with `NotInitialized` once this is false.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.read_state().destroyed
    }

    /// Destroys one loader now: its handles, contexts, and futures go
    /// first (pending futures reject with the cancellation exception),
    /// then the backend.
    pub fn destroy_loader(&self, tag: &str) -> bool {
        let destroyed = {
            let tag = tag.to_string();
            self.with_state(move |state, tracer| {
                let RuntimeState { heap, registry, .. } = state;
                registry.destroy_loader(&tag, heap, tracer)
            })
        };
        if destroyed {
            self.gates
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(tag);
        }
        destroyed
    }

    /// Tears the whole runtime down: loaders in reverse initialization
    /// order, orphan futures cancelled, further operations refused.
    pub fn destroy(&self) {
        self.with_state(move |state, tracer| {
            if state.destroyed {
                return;
            }
            let RuntimeState {
                heap,
                registry,
                orphan_pending,
                ..
            } = state;
            for future_id in orphan_pending.drain() {
                let rejection = crate::exceptions::throwable_from(heap, Exception::cancelled());
                crate::future::settle(heap, future_id, Err(rejection));
                heap.dec_ref(future_id);
            }
            registry.destroy_all(heap, tracer);
            state.destroyed = true;
            tracer.event(&TraceEvent::RuntimeDestroyed);
        });
        self.gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }

    /// Best-effort routing probe: which loader will `name` mutate?
    fn routing_tag(&self, name: &str) -> Option<String> {
        let state = self.read_state();
        state.resolve(name).map(|resolved| match resolved {
            Resolved::Symbol { tag, .. } | Resolved::Member { tag, .. } => tag,
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Wraps a host callback into the heap-level settlement callback shape.
fn adapt_callback(callback: HostCallback) -> SettleFn {
    Box::new(move |heap, value| {
        let host = host::outtake_owned(heap, value);
        callback(host);
    })
}

/// The pending-future table awaits route through: the origin loader's when
/// one is recorded, the orphan table otherwise.
fn pending_for<'a>(
    registry: &'a mut Registry,
    orphan: &'a mut PendingFutures,
    origin: Option<&str>,
) -> &'a mut PendingFutures {
    match origin.and_then(|tag| registry.get_mut(tag)) {
        Some(loader) => loader.pending_mut(),
        None => orphan,
    }
}

/// The origin tag recorded on an object's class, if any.
fn object_origin(heap: &Heap, object_id: HeapId) -> Option<String> {
    match heap.get(object_id) {
        HeapData::Object(instance) => match heap.get_if_live(instance.class_id()) {
            Some(HeapData::Class(class)) => class.origin().map(str::to_string),
            _ => None,
        },
        _ => None,
    }
}

impl RuntimeState {
    fn check_alive(&self) -> DispatchResult<()> {
        if self.destroyed {
            Err(DispatchError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Validates a caller-held reference before use.
    fn expect_kind(&self, id: HeapId, expected: ValueId) -> DispatchResult<()> {
        match self.heap.get_if_live(id) {
            Some(data) if data.value_id() == expected => Ok(()),
            _ => Err(DispatchError::StaleReference),
        }
    }

    /// Instantiates and initializes the loader for `tag` on first use.
    fn ensure_loader(&mut self, tag: &str, tracer: &dyn RuntimeTracer) -> DispatchResult<()> {
        if self.registry.contains(tag) {
            return Ok(());
        }
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| DispatchError::Load(LoadError::LoaderNotFound(tag.to_string())))?;
        let mut loader = LoaderImpl::new(tag, factory());
        loader
            .initialize(&self.config)
            .map_err(|err| DispatchError::Load(LoadError::Initialize(err.to_string())))?;
        self.registry.insert(loader);
        tracer.event(&TraceEvent::LoaderInitialized { tag: tag.to_string() });
        Ok(())
    }

    /// Resolves a call-site name per the dispatcher rules.
    fn resolve(&self, name: &str) -> Option<Resolved> {
        if let Some((qualifier, member)) = name.split_once('.') {
            // Qualifier as a handle name, in loader initialization order.
            for loader in self.registry.iter() {
                if let Some(index) = loader.handle_index(qualifier)
                    && let Some(handle) = loader.handle(index)
                    && let Some(value) = handle.symbol(member)
                    && let Some(id) = value.ref_id()
                {
                    return Some(Resolved::Symbol {
                        tag: loader.tag().to_string(),
                        id,
                    });
                }
            }
            // Qualifier as a class or object symbol with a member.
            if let Some(Resolved::Symbol { tag, id }) = self.resolve_bare(qualifier) {
                if matches!(self.heap.get(id), HeapData::Class(_) | HeapData::Object(_)) {
                    return Some(Resolved::Member {
                        tag,
                        owner: id,
                        member: member.to_string(),
                    });
                }
            }
            return None;
        }
        self.resolve_bare(name)
    }

    fn resolve_bare(&self, name: &str) -> Option<Resolved> {
        for loader in self.registry.iter() {
            if let Some(value) = loader.find_symbol(name)
                && let Some(id) = value.ref_id()
            {
                return Some(Resolved::Symbol {
                    tag: loader.tag().to_string(),
                    id,
                });
            }
        }
        None
    }

    /// Reifies a guest call result into a boundary value: results pass
    /// through, exceptions become throwables.
    fn guest_result_to_host(&mut self, result: Result<Value, Exception>) -> HostValue {
        let heap = &mut self.heap;
        match result {
            Ok(value) => host::outtake_owned(heap, value),
            Err(exception) => {
                let thrown = crate::exceptions::throwable_from(heap, exception);
                host::outtake_owned(heap, thrown)
            }
        }
    }

    fn call_by_name(&mut self, name: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let resolved = self
            .resolve(name)
            .ok_or_else(|| DispatchError::SymbolNotFound(name.to_string()))?;
        match resolved {
            Resolved::Symbol { id, .. } => self.dispatch_symbol(name, id, args),
            Resolved::Member { owner, member, .. } => self.dispatch_member(owner, &member, args),
        }
    }

    fn call_in_handle(&mut self, handle: &HandleRef, symbol: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let loader = self
            .registry
            .get(&handle.tag)
            .ok_or_else(|| DispatchError::Load(LoadError::LoaderNotFound(handle.tag.clone())))?;
        let id = loader
            .handle(handle.index)
            .ok_or(DispatchError::StaleReference)?
            .symbol(symbol)
            .and_then(Value::ref_id)
            .ok_or_else(|| DispatchError::SymbolNotFound(symbol.to_string()))?;
        self.dispatch_symbol(symbol, id, args)
    }

    /// Dispatches on the resolved symbol's kind: functions invoke, classes
    /// construct; anything else is not callable.
    fn dispatch_symbol(&mut self, name: &str, id: HeapId, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        match self.heap.get(id) {
            HeapData::Function(_) => self.invoke_function_value(id, args),
            HeapData::Class(_) => {
                let heap = &mut self.heap;
                let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
                let result = klass::class_new(heap, id, "", None, &values);
                function::release_args(heap, values);
                Ok(self.guest_result_to_host(result))
            }
            _ => Err(DispatchError::NotCallable(name.to_string())),
        }
    }

    fn dispatch_member(&mut self, owner: HeapId, member: &str, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        match self.heap.get(owner) {
            HeapData::Object(_) => self.invoke_object_method(owner, member, args, &NoopTracer),
            HeapData::Class(_) => {
                let heap = &mut self.heap;
                let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
                let result = klass::class_static_call(heap, owner, member, values);
                Ok(self.guest_result_to_host(result))
            }
            _ => Err(DispatchError::NotCallable(member.to_string())),
        }
    }

    /// Full function invocation: coercion, sync/async discrimination, and
    /// transparent awaiting of asynchronous functions.
    fn invoke_function_value(&mut self, fun_id: HeapId, args: Vec<HostValue>) -> DispatchResult<HostValue> {
        let HeapData::Function(fun) = self.heap.get(fun_id) else {
            return Err(DispatchError::StaleReference);
        };
        let is_async = fun.is_async();
        let variadic = fun.is_variadic();
        let has_invalid = fun.signature().has_invalid_slot();
        let origin = fun.origin().map(str::to_string);
        let params: Vec<Option<Type>> = fun.signature().iter().map(|p| p.ty().cloned()).collect();

        let heap = &mut self.heap;
        let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
        let values = match coerce_args(heap, values, &params, variadic, has_invalid) {
            Ok(values) => values,
            Err(exception) => return Ok(self.guest_result_to_host(Err(exception))),
        };

        if is_async {
            let RuntimeState {
                heap,
                registry,
                orphan_pending,
                ..
            } = self;
            let pending = pending_for(registry, orphan_pending, origin.as_deref());
            let future = function::await_with(heap, fun_id, values, None, None, pending);
            let future_id = future.ref_id().expect("await produces a future");
            let settled = self.drive_until_settled(future_id, origin.as_deref(), &NoopTracer);
            let heap = &mut self.heap;
            let settled = match settled {
                Ok(settled) => settled,
                Err(err) => {
                    future.drop_with_heap(heap);
                    return Err(err);
                }
            };
            future.drop_with_heap(heap);
            Ok(match settled {
                Ok(value) => host::outtake_owned(heap, value),
                Err(thrown) => host::outtake_owned(heap, thrown),
            })
        } else {
            let result = function::invoke(heap, fun_id, values);
            Ok(self.guest_result_to_host(result))
        }
    }

    fn invoke_object_method(
        &mut self,
        object_id: HeapId,
        method: &str,
        args: Vec<HostValue>,
        tracer: &dyn RuntimeTracer,
    ) -> DispatchResult<HostValue> {
        let origin = object_origin(&self.heap, object_id);
        let is_async = self.method_is_async(object_id, method, &args);
        let RuntimeState {
            heap,
            registry,
            orphan_pending,
            ..
        } = self;
        let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
        if is_async {
            let pending = pending_for(registry, orphan_pending, origin.as_deref());
            let future = match klass::object_await(heap, object_id, method, values, None, None, pending) {
                Ok(future) => future,
                Err(exception) => return Ok(self.guest_result_to_host(Err(exception))),
            };
            let future_id = future.ref_id().expect("await produces a future");
            let settled = self.drive_until_settled(future_id, origin.as_deref(), tracer);
            let heap = &mut self.heap;
            let settled = match settled {
                Ok(settled) => settled,
                Err(err) => {
                    future.drop_with_heap(heap);
                    return Err(err);
                }
            };
            future.drop_with_heap(heap);
            Ok(match settled {
                Ok(value) => host::outtake_owned(heap, value),
                Err(thrown) => host::outtake_owned(heap, thrown),
            })
        } else {
            let result = klass::object_call(heap, object_id, method, values);
            Ok(self.guest_result_to_host(result))
        }
    }

    /// Whether the overload `method` resolves to for these arguments is
    /// asynchronous. Unresolvable methods report `false`; the invocation
    /// path produces the real error.
    fn method_is_async(&mut self, object_id: HeapId, method: &str, args: &[HostValue]) -> bool {
        let arg_ids: Vec<ValueId> = args.iter().map(HostValue::value_id).collect();
        let HeapData::Object(instance) = self.heap.get(object_id) else {
            return false;
        };
        match self.heap.get_if_live(instance.class_id()) {
            Some(HeapData::Class(class)) => class
                .resolve_method(method, &arg_ids)
                .is_some_and(|descriptor| descriptor.is_async()),
            _ => false,
        }
    }

    /// Begins an awaited call by name; returns the future boundary value.
    fn await_by_name(
        &mut self,
        name: &str,
        args: Vec<HostValue>,
        on_resolve: Option<SettleFn>,
        on_reject: Option<SettleFn>,
    ) -> DispatchResult<HostValue> {
        let resolved = self
            .resolve(name)
            .ok_or_else(|| DispatchError::SymbolNotFound(name.to_string()))?;
        let Resolved::Symbol { id, .. } = resolved else {
            return Err(DispatchError::NotCallable(name.to_string()));
        };
        let HeapData::Function(fun) = self.heap.get(id) else {
            return Err(DispatchError::NotCallable(name.to_string()));
        };
        let origin = fun.origin().map(str::to_string);
        let RuntimeState {
            heap,
            registry,
            orphan_pending,
            ..
        } = self;
        let values: Vec<Value> = args.into_iter().map(|arg| host::intake(heap, arg)).collect();
        let pending = pending_for(registry, orphan_pending, origin.as_deref());
        let future = function::await_with(heap, id, values, on_resolve, on_reject, pending);
        Ok(host::outtake_owned(heap, future))
    }

    /// Drives event loops until the future settles. Pumps the origin
    /// loader when known, every loader otherwise; reports
    /// `EventLoopStalled` when a full round settles nothing and the future
    /// is still pending.
    fn drive_until_settled(
        &mut self,
        future_id: HeapId,
        origin: Option<&str>,
        tracer: &dyn RuntimeTracer,
    ) -> DispatchResult<Result<Value, Value>> {
        loop {
            if let Some(settled) = settled_result(&self.heap, future_id) {
                return Ok(settled);
            }
            let RuntimeState { heap, registry, .. } = self;
            let mut progressed = 0;
            match origin {
                Some(tag) => {
                    if let Some(loader) = registry.get_mut(tag) {
                        for fulfilled in loader.pump(heap) {
                            progressed += 1;
                            tracer.event(&TraceEvent::FutureSettled {
                                tag: tag.to_string(),
                                fulfilled,
                            });
                        }
                    }
                }
                None => {
                    for loader in registry.iter_mut() {
                        let tag = loader.tag().to_string();
                        for fulfilled in loader.pump(heap) {
                            progressed += 1;
                            tracer.event(&TraceEvent::FutureSettled {
                                tag: tag.clone(),
                                fulfilled,
                            });
                        }
                    }
                }
            }
            if progressed == 0 {
                return Err(DispatchError::EventLoopStalled);
            }
        }
    }
}

/// Coerces call arguments against the signature slots.
///
/// Variadic functions receive their arguments uncoerced; signatures still
/// carrying `Invalid` placeholders are refused otherwise. Unresolved
/// (`None`) slots pass their argument through unchanged.
fn coerce_args(
    heap: &mut Heap,
    values: Vec<Value>,
    params: &[Option<Type>],
    variadic: bool,
    has_invalid: bool,
) -> Result<Vec<Value>, Exception> {
    if variadic {
        return Ok(values);
    }
    if has_invalid {
        function::release_args(heap, values);
        return Err(Exception::type_error("signature contains unresolved parameter types"));
    }
    if values.len() != params.len() {
        let expected = params.len();
        let got = values.len();
        function::release_args(heap, values);
        return Err(Exception::type_error(format!(
            "expected {expected} arguments, got {got}"
        )));
    }
    let mut out = Vec::with_capacity(values.len());
    let mut iter = values.into_iter();
    for param in params {
        let value = iter.next().expect("length checked above");
        match param {
            None => out.push(value),
            Some(ty) => {
                if value.value_id(heap) == ty.id() {
                    out.push(value);
                } else {
                    match value.cast(heap, ty.id()) {
                        Ok(coerced) => out.push(coerced),
                        Err(err) => {
                            function::release_args(heap, out);
                            for rest in iter {
                                rest.drop_with_heap(heap);
                            }
                            return Err(Exception::type_error(err.to_string()));
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}
