//! Loader backends shipped with the core.
//!
//! Real language backends live in their own crates and plug in through
//! [`crate::loader::LoaderBackend`]; the core only carries the mock backend,
//! which fabricates deterministic symbols so the dispatcher, registry, and
//! embedder test suites have a complete loader with no guest runtime.

pub mod mock;
