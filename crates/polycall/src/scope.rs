//! Hierarchical namespaces holding what loaders discover.
//!
//! A [`Context`] owns all of a handle's scopes in a central arena and hands
//! out [`ScopeId`] indices instead of parent back-pointers; the root scope is
//! always index 0. A [`Scope`] maps names to owned values in insertion
//! order. Lookup walks parent-ward, so child scopes shadow their parents.
//!
//! Destruction is explicit and bottom-up: every owned value is released into
//! the heap before the context goes away.

use indexmap::IndexMap;

use crate::{heap::Heap, value::Value};

/// Index of a scope inside its owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The root scope of every context.
    pub const ROOT: Self = Self(0);

    fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("scope arena exceeds u32 indices"))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A name → value mapping with stable (insertion) iteration order.
pub struct Scope {
    name: Box<str>,
    bindings: IndexMap<String, Value>,
    parent: Option<ScopeId>,
}

impl Scope {
    fn new(name: impl Into<Box<str>>, parent: Option<ScopeId>) -> Self {
        Self {
            name: name.into(),
            bindings: IndexMap::new(),
            parent,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    /// Binds `name` to `value`, transferring ownership to the scope.
    /// Redefining a name releases the previous value.
    pub fn define(&mut self, heap: &mut Heap, name: impl Into<String>, value: Value) {
        if let Some(previous) = self.bindings.insert(name.into(), value) {
            previous.drop_with_heap(heap);
        }
    }

    /// Removes a binding, releasing its value. Returns whether it existed.
    pub fn undefine(&mut self, heap: &mut Heap, name: &str) -> bool {
        match self.bindings.shift_remove(name) {
            Some(value) => {
                value.drop_with_heap(heap);
                true
            }
            None => false,
        }
    }

    /// Borrows the value bound to `name` in this scope only (no parent
    /// walk). The caller must not release the returned value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterates bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(name, value)| (name.as_str(), value))
    }

    fn drain_into(&mut self, heap: &mut Heap) {
        for (_, value) in self.bindings.drain(..) {
            value.drop_with_heap(heap);
        }
    }
}

/// The scope tree of one handle.
pub struct Context {
    scopes: Vec<Scope>,
}

impl Context {
    /// Creates a context with a root scope of the given name.
    #[must_use]
    pub fn new(root_name: impl Into<Box<str>>) -> Self {
        Self {
            scopes: vec![Scope::new(root_name, None)],
        }
    }

    #[must_use]
    pub fn root(&self) -> &Scope {
        &self.scopes[ScopeId::ROOT.index()]
    }

    pub fn root_mut(&mut self) -> &mut Scope {
        &mut self.scopes[ScopeId::ROOT.index()]
    }

    /// Spawns a child scope under `parent` and returns its index.
    pub fn child(&mut self, parent: ScopeId, name: impl Into<Box<str>>) -> ScopeId {
        let id = ScopeId::new(self.scopes.len());
        self.scopes.push(Scope::new(name, Some(parent)));
        id
    }

    #[must_use]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.index()]
    }

    /// Number of scopes in the context (root included).
    #[must_use]
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Resolves `name` starting at `from` and walking parent-ward. Child
    /// bindings shadow parent bindings.
    #[must_use]
    pub fn lookup(&self, from: ScopeId, name: &str) -> Option<&Value> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = self.scope(id);
            if let Some(value) = scope.get(name) {
                return Some(value);
            }
            cursor = scope.parent();
        }
        None
    }

    /// Releases every binding in every scope, children before parents, and
    /// empties the context. Must run before the context is dropped.
    pub fn destroy(&mut self, heap: &mut Heap) {
        // Children were appended after their parents, so reverse order is
        // bottom-up.
        for scope in self.scopes.iter_mut().rev() {
            scope.drain_into(heap);
        }
        self.scopes.truncate(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_transfers_ownership_and_redefine_drops() {
        let mut heap = Heap::new();
        let mut ctx = Context::new("module");
        let first = heap.new_string("first");
        let root = ScopeId::ROOT;
        ctx.scope_mut(root).define(&mut heap, "x", first);
        assert_eq!(heap.stats().live_objects, 1);
        let second = heap.new_string("second");
        ctx.scope_mut(root).define(&mut heap, "x", second);
        assert_eq!(heap.stats().live_objects, 1, "redefinition must drop the old value");
        assert_eq!(ctx.root().get("x").unwrap().as_str(&heap), Some("second"));
        ctx.destroy(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn child_scopes_shadow_parent_bindings() {
        let mut heap = Heap::new();
        let mut ctx = Context::new("module");
        let outer = heap.new_string("outer");
        ctx.root_mut().define(&mut heap, "name", outer);
        let child = ctx.child(ScopeId::ROOT, "inner");
        let shadow = heap.new_string("inner");
        ctx.scope_mut(child).define(&mut heap, "name", shadow);

        assert_eq!(ctx.lookup(child, "name").unwrap().as_str(&heap), Some("inner"));
        assert_eq!(ctx.lookup(ScopeId::ROOT, "name").unwrap().as_str(&heap), Some("outer"));
        ctx.destroy(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn lookup_walks_parents_for_missing_names() {
        let mut heap = Heap::new();
        let mut ctx = Context::new("module");
        ctx.root_mut().define(&mut heap, "only_here", Value::Int(1));
        let child = ctx.child(ScopeId::ROOT, "inner");
        let grandchild = ctx.child(child, "innermost");
        assert_eq!(ctx.lookup(grandchild, "only_here").unwrap().as_int(), Some(1));
        assert!(ctx.lookup(grandchild, "nowhere").is_none());
        ctx.destroy(&mut heap);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut heap = Heap::new();
        let mut ctx = Context::new("module");
        for name in ["zeta", "alpha", "mid"] {
            ctx.root_mut().define(&mut heap, name, Value::Int(0));
        }
        let order: Vec<&str> = ctx.root().iter().map(|(name, _)| name).collect();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
        ctx.destroy(&mut heap);
    }

    #[test]
    fn undefine_releases_the_value() {
        let mut heap = Heap::new();
        let mut ctx = Context::new("module");
        let v = heap.new_string("gone");
        ctx.root_mut().define(&mut heap, "v", v);
        assert!(ctx.root_mut().undefine(&mut heap, "v"));
        assert!(!ctx.root_mut().undefine(&mut heap, "v"));
        assert_eq!(heap.stats().live_objects, 0);
        ctx.destroy(&mut heap);
    }
}
