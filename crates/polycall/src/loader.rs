//! The loader framework: backend interface, discovery, handles.
//!
//! A [`LoaderBackend`] embeds one guest runtime behind a uniform operation
//! table. Every operation is optional — the default bodies report
//! `NotSupported` — so partial backends plug in cleanly. A [`LoaderImpl`]
//! wraps one live backend together with everything the core tracks for it:
//! its type registry, execution paths, handle table, and in-flight futures.
//!
//! During discovery the backend enumerates its module's public surface
//! through a [`Discovery`] builder, which allocates reflection entities on
//! the heap and binds them into the handle's root scope.

use std::{
    path::{Path, PathBuf},
    thread::ThreadId,
};

use ahash::AHashMap;

use crate::{
    config::Configuration,
    error::{LoadError, LoadResult},
    exceptions::Exception,
    function::Function,
    future::{CallTicket, PendingFutures},
    heap::Heap,
    klass::Class,
    scope::{Context, Scope},
    types::{Type, TypeRegistry},
    value::Value,
};

/// Backend-internal identity of one loaded module. Opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// A finished asynchronous invocation reported by a backend's event loop.
pub struct Completion {
    pub ticket: CallTicket,
    pub result: Result<Value, Exception>,
}

/// Initialization inputs handed to a backend.
pub struct LoaderConfig<'a> {
    /// The tag the backend was registered under.
    pub tag: &'a str,
    /// Free-form options from the runtime configuration, if any.
    pub options: Option<&'a serde_json::Value>,
    /// Script search paths from the runtime configuration.
    pub script_paths: &'a [PathBuf],
}

/// The per-language backend operation table.
///
/// Backends receive the heap wherever they may need to allocate or release
/// values. Guest failures surface as `Exception` results on the invocation
/// paths and as `LoadError` on the load paths; backends never unwind.
pub trait LoaderBackend: Send + Sync {
    /// Called once before any other operation.
    fn initialize(&mut self, config: &LoaderConfig<'_>) -> LoadResult<()> {
        let _ = config;
        Ok(())
    }

    /// Declares whether entry points must be serialized onto the thread
    /// that initialized this backend.
    fn is_thread_confined(&self) -> bool {
        false
    }

    /// Adds a search path for subsequent loads.
    fn execution_path(&mut self, path: &Path) -> LoadResult<()> {
        let _ = path;
        Err(LoadError::NotSupported("execution_path"))
    }

    /// Loads one unit of code from source files.
    fn load_from_file(&mut self, paths: &[PathBuf]) -> LoadResult<ModuleId> {
        let _ = paths;
        Err(LoadError::NotSupported("load_from_file"))
    }

    /// Loads one unit of code from an in-memory buffer.
    fn load_from_memory(&mut self, name: &str, buffer: &[u8]) -> LoadResult<ModuleId> {
        let _ = (name, buffer);
        Err(LoadError::NotSupported("load_from_memory"))
    }

    /// Loads a compiled artifact.
    fn load_from_package(&mut self, path: &Path) -> LoadResult<ModuleId> {
        let _ = path;
        Err(LoadError::NotSupported("load_from_package"))
    }

    /// Unloads one module.
    fn clear(&mut self, module: ModuleId) -> LoadResult<()> {
        let _ = module;
        Ok(())
    }

    /// Enumerates the module's public surface into the handle scope.
    fn discover(&mut self, module: ModuleId, discovery: &mut Discovery<'_>) -> LoadResult<()> {
        let _ = (module, discovery);
        Err(LoadError::NotSupported("discover"))
    }

    /// Pumps the backend's event loop once, returning any completions for
    /// previously scheduled asynchronous invocations. The default reports
    /// none, which is correct for backends without an event loop.
    fn drive(&mut self, heap: &mut Heap) -> Vec<Completion> {
        let _ = heap;
        Vec::new()
    }

    /// Final operation; the core has already dropped every handle.
    fn destroy(&mut self, heap: &mut Heap) -> LoadResult<()> {
        let _ = heap;
        Ok(())
    }
}

/// Scope-building facade handed to backends during discovery.
///
/// Everything defined here is owned by the handle's root scope and released
/// when the handle is cleared or its loader destroyed.
pub struct Discovery<'a> {
    tag: &'a str,
    heap: &'a mut Heap,
    scope: &'a mut Scope,
    types: &'a mut TypeRegistry,
}

impl Discovery<'_> {
    /// Direct heap access for allocating default or constant values.
    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    /// Resolves a backend type name through the loader's registry, creating
    /// an `Invalid` placeholder for names nobody registered.
    pub fn resolve_type(&mut self, name: &str) -> Type {
        self.types.resolve(name)
    }

    /// Registers a type descriptor under the loader.
    pub fn register_type(&mut self, name: &str, id: crate::value::ValueId) -> Type {
        self.types.register(name, id)
    }

    /// Binds an arbitrary value (ownership transfers to the scope).
    pub fn define_value(&mut self, name: &str, value: Value) {
        self.scope.define(self.heap, name, value);
    }

    /// Allocates `function` on the heap and binds it under its name. The
    /// function is stamped with the loader tag so the dispatcher can route
    /// awaits back to this loader's event loop.
    pub fn define_function(&mut self, function: Function) {
        let function = function.with_origin(self.tag);
        let name = function.name().to_string();
        let value = self.heap.new_function(function);
        self.scope.define(self.heap, name, value);
    }

    /// Allocates `class` on the heap and binds it under its name, stamped
    /// with the loader tag like functions are.
    pub fn define_class(&mut self, class: Class) {
        let class = class.with_origin(self.tag);
        let name = class.name().to_string();
        let value = self.heap.new_class(class);
        self.scope.define(self.heap, name, value);
    }
}

/// A named unit of loaded code: the backend module plus the context holding
/// what discovery found in it.
pub struct Handle {
    name: String,
    public: bool,
    module: ModuleId,
    context: Context,
}

impl Handle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public handles are registered by name and visible to cross-process
    /// lookup; private handles are only reachable through the caller-held
    /// reference.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.public
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Borrows the value bound under `symbol` in the handle's root scope.
    #[must_use]
    pub fn symbol(&self, symbol: &str) -> Option<&Value> {
        self.context.root().get(symbol)
    }
}

/// Caller-held reference to a loaded handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRef {
    pub(crate) tag: String,
    pub(crate) index: usize,
}

impl HandleRef {
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// The source a load request reads from.
pub enum LoadSource {
    File(Vec<PathBuf>),
    Memory { name: String, buffer: Vec<u8> },
    Package(PathBuf),
}

impl LoadSource {
    /// The handle name a load of this source produces.
    fn handle_name(&self) -> String {
        match self {
            Self::File(paths) => paths
                .first()
                .and_then(|p| p.file_name())
                .map_or_else(|| "<file>".to_string(), |n| n.to_string_lossy().into_owned()),
            Self::Memory { name, .. } => name.clone(),
            Self::Package(path) => path
                .file_name()
                .map_or_else(|| "<package>".to_string(), |n| n.to_string_lossy().into_owned()),
        }
    }
}

/// One live loader: the backend plus everything the core tracks for it.
pub struct LoaderImpl {
    tag: String,
    backend: Box<dyn LoaderBackend>,
    types: TypeRegistry,
    exec_paths: Vec<PathBuf>,
    /// Handle slab; cleared slots stay `None` so caller-held indices cannot
    /// alias a later handle.
    handles: Vec<Option<Handle>>,
    /// Public handles by name.
    by_name: AHashMap<String, usize>,
    pending: PendingFutures,
    /// Set when the backend is thread-confined: the thread that initialized
    /// it, onto which all mutating entry points are serialized.
    confined: Option<ThreadId>,
}

impl LoaderImpl {
    #[must_use]
    pub fn new(tag: impl Into<String>, backend: Box<dyn LoaderBackend>) -> Self {
        Self {
            tag: tag.into(),
            backend,
            types: TypeRegistry::new(),
            exec_paths: Vec::new(),
            handles: Vec::new(),
            by_name: AHashMap::new(),
            pending: PendingFutures::default(),
            confined: None,
        }
    }

    /// Initializes the backend. Must be the first operation.
    pub fn initialize(&mut self, config: &Configuration) -> LoadResult<()> {
        let loader_config = LoaderConfig {
            tag: &self.tag,
            options: config.loader_options(&self.tag),
            script_paths: &config.script_paths,
        };
        self.backend.initialize(&loader_config)?;
        if self.backend.is_thread_confined() {
            self.confined = Some(std::thread::current().id());
        }
        Ok(())
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// The thread this loader is confined to, when the backend declared
    /// itself thread-confined.
    #[must_use]
    pub fn confined_to(&self) -> Option<ThreadId> {
        self.confined
    }

    #[must_use]
    pub fn execution_paths(&self) -> &[PathBuf] {
        &self.exec_paths
    }

    pub fn pending_mut(&mut self) -> &mut PendingFutures {
        &mut self.pending
    }

    /// Adds a search path, recording it and forwarding to the backend.
    pub fn execution_path(&mut self, path: &Path) -> LoadResult<()> {
        self.backend.execution_path(path)?;
        self.exec_paths.push(path.to_path_buf());
        Ok(())
    }

    /// Loads a unit of code and runs discovery over it, producing a handle.
    ///
    /// Public handles register under their derived name (duplicates are
    /// refused); private handles skip name registration, so the same source
    /// may be loaded any number of times with isolated contexts.
    pub fn load(&mut self, heap: &mut Heap, source: &LoadSource, public: bool) -> LoadResult<usize> {
        let name = source.handle_name();
        if public && self.by_name.contains_key(&name) {
            return Err(LoadError::DuplicateHandle(name));
        }
        let module = match source {
            LoadSource::File(paths) => self.backend.load_from_file(paths)?,
            LoadSource::Memory { name, buffer } => self.backend.load_from_memory(name, buffer)?,
            LoadSource::Package(path) => self.backend.load_from_package(path)?,
        };
        let mut context = Context::new(name.as_str());
        let mut discovery = Discovery {
            tag: &self.tag,
            heap: &mut *heap,
            scope: context.root_mut(),
            types: &mut self.types,
        };
        if let Err(err) = self.backend.discover(module, &mut discovery) {
            context.destroy(heap);
            let _ = self.backend.clear(module);
            return Err(err);
        }
        let handle = Handle {
            name: name.clone(),
            public,
            module,
            context,
        };
        let index = self.handles.len();
        self.handles.push(Some(handle));
        if public {
            self.by_name.insert(name, index);
        }
        Ok(index)
    }

    /// Unloads the handle at `index`, releasing its context.
    pub fn clear(&mut self, heap: &mut Heap, index: usize) -> LoadResult<()> {
        let slot = self.handles.get_mut(index).ok_or(LoadError::InvalidHandle)?;
        let mut handle = slot.take().ok_or(LoadError::InvalidHandle)?;
        if handle.public {
            self.by_name.remove(&handle.name);
        }
        handle.context.destroy(heap);
        self.backend.clear(handle.module)
    }

    #[must_use]
    pub fn handle(&self, index: usize) -> Option<&Handle> {
        self.handles.get(index)?.as_ref()
    }

    pub fn handle_mut(&mut self, index: usize) -> Option<&mut Handle> {
        self.handles.get_mut(index)?.as_mut()
    }

    #[must_use]
    pub fn handle_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Iterates live public handles in load order.
    pub fn public_handles(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter().flatten().filter(|h| h.is_public())
    }

    /// Resolves `symbol` across public handles in load order.
    #[must_use]
    pub fn find_symbol(&self, symbol: &str) -> Option<&Value> {
        self.public_handles().find_map(|handle| handle.symbol(symbol))
    }

    /// Pumps the backend's event loop once and settles any completed
    /// futures. Returns the fulfillment flag of each settled future.
    pub fn pump(&mut self, heap: &mut Heap) -> Vec<bool> {
        let completions = self.backend.drive(heap);
        let mut settled = Vec::with_capacity(completions.len());
        for Completion { ticket, result } in completions {
            let Some(future_id) = self.pending.complete(ticket) else {
                // Completion for a future we no longer track (already
                // cancelled); release the payload and move on.
                match result {
                    Ok(value) => value.drop_with_heap(heap),
                    Err(exception) => exception.release(heap),
                }
                continue;
            };
            settled.push(result.is_ok());
            crate::function::settle_with_result(heap, future_id, result);
            heap.dec_ref(future_id);
        }
        settled
    }

    /// Rejects every outstanding future with the synthetic cancellation
    /// exception. Returns how many were cancelled.
    pub fn cancel_pending(&mut self, heap: &mut Heap) -> usize {
        let orphans = self.pending.drain();
        let count = orphans.len();
        for future_id in orphans {
            let rejection = crate::exceptions::throwable_from(heap, Exception::cancelled());
            crate::future::settle(heap, future_id, Err(rejection));
            heap.dec_ref(future_id);
        }
        count
    }

    /// Tears the loader down: cancels futures, releases every handle and
    /// its context, then destroys the backend. Handle/context teardown runs
    /// strictly before backend destruction.
    pub fn destroy(&mut self, heap: &mut Heap) -> LoadResult<()> {
        self.cancel_pending(heap);
        for slot in &mut self.handles {
            if let Some(mut handle) = slot.take() {
                handle.context.destroy(heap);
                let _ = self.backend.clear(handle.module);
            }
        }
        self.by_name.clear();
        self.backend.destroy(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;

    /// Minimal backend defining one constant per load.
    struct ConstBackend {
        loads: u32,
    }

    impl LoaderBackend for ConstBackend {
        fn load_from_memory(&mut self, _name: &str, _buffer: &[u8]) -> LoadResult<ModuleId> {
            let id = ModuleId(self.loads);
            self.loads += 1;
            Ok(id)
        }

        fn discover(&mut self, module: ModuleId, discovery: &mut Discovery<'_>) -> LoadResult<()> {
            discovery.define_value("module_index", Value::Int(i32::try_from(module.0).unwrap_or(0)));
            let fun = Function::new("noop", Signature::new(), Box::new(NoopFn));
            discovery.define_function(fun);
            Ok(())
        }
    }

    struct NoopFn;

    impl crate::function::FunctionBackend for NoopFn {
        fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, Exception> {
            crate::function::release_args(heap, args);
            Ok(Value::Null)
        }
    }

    fn memory_source(name: &str) -> LoadSource {
        LoadSource::Memory {
            name: name.to_string(),
            buffer: Vec::new(),
        }
    }

    #[test]
    fn load_discovers_into_a_fresh_context() {
        let mut heap = Heap::new();
        let mut loader = LoaderImpl::new("const", Box::new(ConstBackend { loads: 0 }));
        loader.initialize(&Configuration::default()).unwrap();
        let index = loader.load(&mut heap, &memory_source("unit"), true).unwrap();
        let handle = loader.handle(index).unwrap();
        assert_eq!(handle.name(), "unit");
        assert!(handle.symbol("module_index").is_some());
        assert!(handle.symbol("noop").is_some());
        assert!(loader.find_symbol("noop").is_some());
        loader.destroy(&mut heap).unwrap();
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn duplicate_public_handles_are_refused() {
        let mut heap = Heap::new();
        let mut loader = LoaderImpl::new("const", Box::new(ConstBackend { loads: 0 }));
        loader.initialize(&Configuration::default()).unwrap();
        loader.load(&mut heap, &memory_source("unit"), true).unwrap();
        let err = loader.load(&mut heap, &memory_source("unit"), true).unwrap_err();
        assert_eq!(err, LoadError::DuplicateHandle("unit".to_string()));
        loader.destroy(&mut heap).unwrap();
    }

    #[test]
    fn private_handles_are_isolated_and_invisible() {
        let mut heap = Heap::new();
        let mut loader = LoaderImpl::new("const", Box::new(ConstBackend { loads: 0 }));
        loader.initialize(&Configuration::default()).unwrap();
        let first = loader.load(&mut heap, &memory_source("unit"), false).unwrap();
        let second = loader.load(&mut heap, &memory_source("unit"), false).unwrap();
        assert_ne!(first, second);
        assert!(loader.handle_index("unit").is_none(), "private handles are not named");
        assert!(loader.find_symbol("noop").is_none(), "private symbols do not resolve globally");
        // Clearing the first leaves the second untouched.
        loader.clear(&mut heap, first).unwrap();
        assert!(loader.handle(first).is_none());
        assert!(loader.handle(second).is_some());
        loader.destroy(&mut heap).unwrap();
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn unsupported_operations_report_not_supported() {
        let mut loader = LoaderImpl::new("const", Box::new(ConstBackend { loads: 0 }));
        loader.initialize(&Configuration::default()).unwrap();
        let err = loader.execution_path(Path::new("/tmp")).unwrap_err();
        assert_eq!(err, LoadError::NotSupported("execution_path"));
        let mut heap = Heap::new();
        let err = loader.load(&mut heap, &LoadSource::Package(PathBuf::from("a.pkg")), true).unwrap_err();
        assert_eq!(err, LoadError::NotSupported("load_from_package"));
    }
}
