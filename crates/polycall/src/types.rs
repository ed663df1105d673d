//! Named type descriptors and the per-loader type registry.
//!
//! Every loader names the closed value sorts its own way (`TYPE_INT` may be
//! `"Int32"` in one backend and `"Integer"` in another), so descriptors pair
//! a sort id with the backend's name and live in a registry owned by the
//! loader. Unknown names resolve to an `Invalid` placeholder so signatures
//! built during discovery stay queryable; the dispatcher refuses to invoke
//! through those slots later.

use indexmap::IndexMap;

use crate::value::ValueId;

/// A named type descriptor. Cheap to clone; signatures store copies.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Type {
    id: ValueId,
    name: Box<str>,
}

impl Type {
    #[must_use]
    pub fn new(id: ValueId, name: impl Into<Box<str>>) -> Self {
        Self { id, name: name.into() }
    }

    #[must_use]
    pub fn id(&self) -> ValueId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this descriptor is an unresolved placeholder.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.id == ValueId::Invalid
    }
}

/// Registry of type descriptors known to one loader, keyed by unique name.
/// Iteration follows registration order.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: IndexMap<String, Type>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the canonical lowercase name for every
    /// concrete sort. Backends without their own naming scheme start here.
    #[must_use]
    pub fn with_core_names() -> Self {
        let mut registry = Self::new();
        for raw in 0..ValueId::COUNT {
            let id = ValueId::from_u8(raw).expect("concrete ids are contiguous");
            registry.register(id.to_string(), id);
        }
        registry
    }

    /// Registers (or redefines) a type under `name` and returns a copy of the
    /// descriptor.
    pub fn register(&mut self, name: impl Into<String>, id: ValueId) -> Type {
        let name = name.into();
        let descriptor = Type::new(id, name.as_str());
        self.types.insert(name, descriptor.clone());
        descriptor
    }

    /// Looks up `name`, creating an `Invalid` placeholder when the backend
    /// reported a name nobody registered.
    pub fn resolve(&mut self, name: &str) -> Type {
        if let Some(existing) = self.types.get(name) {
            return existing.clone();
        }
        self.register(name.to_string(), ValueId::Invalid)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name)
    }

    /// First registered descriptor carrying `id`, if any.
    #[must_use]
    pub fn get_by_id(&self, id: ValueId) -> Option<&Type> {
        self.types.values().find(|ty| ty.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Type)> {
        self.types.iter().map(|(name, ty)| (name.as_str(), ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_become_invalid_placeholders() {
        let mut registry = TypeRegistry::new();
        let ty = registry.resolve("Widget");
        assert!(ty.is_invalid());
        assert_eq!(ty.name(), "Widget");
        // The placeholder persists and is returned on subsequent lookups.
        assert_eq!(registry.get("Widget").map(Type::is_invalid), Some(true));
    }

    #[test]
    fn same_id_under_different_names() {
        let mut registry = TypeRegistry::new();
        registry.register("Int32", ValueId::Int);
        registry.register("Integer", ValueId::Int);
        assert_eq!(registry.get("Int32").unwrap().id(), ValueId::Int);
        assert_eq!(registry.get("Integer").unwrap().id(), ValueId::Int);
        assert_eq!(registry.get_by_id(ValueId::Int).unwrap().name(), "Int32");
    }

    #[test]
    fn core_names_cover_every_concrete_sort() {
        let registry = TypeRegistry::with_core_names();
        assert_eq!(registry.len(), usize::from(ValueId::COUNT));
        assert_eq!(registry.get("int").unwrap().id(), ValueId::Int);
        assert_eq!(registry.get("string").unwrap().id(), ValueId::String);
    }
}
