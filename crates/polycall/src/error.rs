//! Error kinds surfaced by the runtime core.
//!
//! Two channels exist, matching the propagation rules of the dispatcher:
//!
//! - Guest failures (an exception raised inside a loaded module, a cast that
//!   cannot be applied at the call boundary) are reified into `Throwable`
//!   values and returned through the normal value channel. They never appear
//!   as `Err` variants here.
//! - Host-side failures that prevent any value from being produced (missing
//!   loader, unknown symbol, backend initialization failure) use the enums in
//!   this module. The dispatcher additionally records them in a thread-local
//!   slot readable via [`last_error`].

use std::{cell::RefCell, fmt};

/// Result alias for loader backend operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Result alias for dispatcher entry points.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors produced by loader backends and the load pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The backend does not implement the requested operation.
    NotSupported(&'static str),
    /// No loader is registered under the requested tag.
    LoaderNotFound(String),
    /// The backend failed to initialize its runtime.
    Initialize(String),
    /// A source file could not be located on any execution path.
    FileNotFound(String),
    /// The backend rejected the source (syntax error, bad package, ...).
    Backend(String),
    /// A handle with this name is already registered in the loader.
    DuplicateHandle(String),
    /// The referenced handle does not exist (already cleared or never loaded).
    InvalidHandle,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported(op) => write!(f, "loader operation not supported: {op}"),
            Self::LoaderNotFound(tag) => write!(f, "no loader registered for tag {tag:?}"),
            Self::Initialize(msg) => write!(f, "loader initialization failed: {msg}"),
            Self::FileNotFound(path) => write!(f, "script not found: {path}"),
            Self::Backend(msg) => write!(f, "load failed: {msg}"),
            Self::DuplicateHandle(name) => write!(f, "handle {name:?} already exists"),
            Self::InvalidHandle => write!(f, "invalid handle"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Errors produced by the dispatcher for conditions where no result value can
/// exist (surfaced as null + error string on C-ABI style surfaces).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The runtime was already destroyed (or never initialized).
    NotInitialized,
    /// The call target could not be resolved to any loaded symbol.
    SymbolNotFound(String),
    /// The resolved symbol is not callable the way it was invoked.
    NotCallable(String),
    /// A load operation failed.
    Load(LoadError),
    /// The awaited future can make no further progress: the owning loader's
    /// event loop reported no pending completions.
    EventLoopStalled,
    /// A serial format was requested that is not registered.
    SerialNotFound(String),
    /// Encoding or decoding through a serial format failed.
    Serial(String),
    /// A caller-held reference (handle, function, object, future) is stale.
    StaleReference,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "runtime is not initialized"),
            Self::SymbolNotFound(name) => write!(f, "symbol {name:?} not found"),
            Self::NotCallable(name) => write!(f, "symbol {name:?} is not callable"),
            Self::Load(err) => write!(f, "{err}"),
            Self::EventLoopStalled => write!(f, "event loop made no progress while a future was pending"),
            Self::SerialNotFound(name) => write!(f, "no serial format registered under {name:?}"),
            Self::Serial(msg) => write!(f, "serialization failed: {msg}"),
            Self::StaleReference => write!(f, "reference is no longer valid"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<LoadError> for DispatchError {
    fn from(err: LoadError) -> Self {
        Self::Load(err)
    }
}

/// Process exit codes reserved for front-end collaborators embedding the core.
pub mod exit_code {
    /// Completed without error.
    pub const SUCCESS: i32 = 0;
    /// Generic failure.
    pub const ERROR: i32 = 1;
    /// A load operation failed.
    pub const LOAD_ERROR: i32 = 2;
    /// An invocation failed.
    pub const INVOKE_ERROR: i32 = 3;
    /// The runtime could not be brought up at all.
    pub const INIT_ERROR: i32 = 5;
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Records an error message in the calling thread's error slot.
///
/// The dispatcher calls this on every fatal (null-producing) path so embedders
/// polling the C-ABI style interface can retrieve a description afterwards.
pub(crate) fn set_last_error(message: impl Into<String>) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message.into()));
}

/// Clears the calling thread's error slot.
pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Returns the most recent fatal error recorded on the calling thread, if any.
///
/// The slot is overwritten by each new fatal error and cleared by successful
/// lifecycle operations; it is never touched by guest exceptions, which travel
/// as `Throwable` values instead.
#[must_use]
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_thread_local() {
        set_last_error("outer");
        let handle = std::thread::spawn(|| {
            assert_eq!(last_error(), None);
            set_last_error("inner");
            assert_eq!(last_error(), Some("inner".to_string()));
        });
        handle.join().unwrap();
        assert_eq!(last_error(), Some("outer".to_string()));
        clear_last_error();
        assert_eq!(last_error(), None);
    }

    #[test]
    fn dispatch_error_wraps_load_error() {
        let err: DispatchError = LoadError::LoaderNotFound("py".to_string()).into();
        assert_eq!(err.to_string(), "no loader registered for tag \"py\"");
    }
}
