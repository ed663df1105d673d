#![doc = include_str!("../../../README.md")]

mod dispatch;
mod error;
mod exceptions;
mod function;
mod future;
mod heap;
mod host;
mod klass;
mod loader;
mod registry;
mod scope;
mod signature;
mod task_queue;
mod types;
mod value;

pub mod config;
pub mod inspect;
pub mod loaders;
pub mod serial;
pub mod tracer;

pub use crate::{
    config::{ConfigError, Configuration},
    dispatch::{BackendFactory, HostCallback, Runtime},
    error::{DispatchError, DispatchResult, LoadError, LoadResult, exit_code, last_error},
    exceptions::{CANCELLED_CODE, CANCELLED_LABEL, Exception, Throwable, throwable_from},
    function::{AsyncStart, Function, FunctionBackend},
    future::{CallTicket, Future, FutureState, PendingFutures, SettleFn},
    heap::{Heap, HeapData, HeapId, HeapStats},
    host::{ClassRef, ExceptionData, FunctionRef, FutureRef, HostValue, ObjectRef},
    klass::{
        AccessorMode, Attribute, Class, ClassBackend, Constructor, Instance, InstanceBackend, Method, Visibility,
    },
    loader::{
        Completion, Discovery, Handle, HandleRef, LoadSource, LoaderBackend, LoaderConfig, LoaderImpl, ModuleId,
    },
    registry::Registry,
    scope::{Context, Scope, ScopeId},
    signature::{Param, Signature, SignatureMatch},
    types::{Type, TypeRegistry},
    value::{CastError, Value, ValueId},
};
